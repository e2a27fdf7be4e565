use std::collections::HashMap;

use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, ScalarAttributeType};
use dynasink_dynamodb::Error as DynamoError;
use dynasink_dynamodb::table::DynamoTable;

use crate::mapper::{AttributeMap, Scalar};
use crate::schema::AttributeKind;
use crate::store::{StoreError, TableDescriptor, TableStore};

impl From<DynamoError> for StoreError {
    fn from(value: DynamoError) -> Self {
        match value {
            DynamoError::TableNotFound(table) => {
                StoreError::not_found(format!("table {table} not found"))
            }
            DynamoError::Transient(msg) => StoreError::transient(msg),
            DynamoError::Rejected(msg) | DynamoError::InvalidConfig(msg) | DynamoError::Other(msg) => {
                StoreError::permanent(msg)
            }
        }
    }
}

impl TableStore for DynamoTable {
    async fn describe_table(&self, table: &str) -> Result<TableDescriptor, StoreError> {
        let description = self.describe(table).await?;

        let attributes = description
            .attribute_definitions()
            .iter()
            .map(|definition| {
                (
                    definition.attribute_name().to_string(),
                    attribute_kind(definition.attribute_type()),
                )
            })
            .collect();
        let key_attributes = description
            .key_schema()
            .iter()
            .map(|key| key.attribute_name().to_string())
            .collect();

        Ok(TableDescriptor {
            table: table.to_string(),
            attributes,
            key_attributes,
        })
    }

    async fn put_item(&self, table: &str, item: &AttributeMap) -> Result<(), StoreError> {
        let item: HashMap<String, AttributeValue> = item
            .iter()
            .map(|(name, scalar)| (name.clone(), attribute_value(scalar)))
            .collect();
        self.put(table, item).await?;
        Ok(())
    }
}

fn attribute_kind(attribute_type: &ScalarAttributeType) -> AttributeKind {
    match attribute_type {
        ScalarAttributeType::N => AttributeKind::Number,
        ScalarAttributeType::B => AttributeKind::Binary,
        // S and any type added to the service later are carried as strings
        _ => AttributeKind::String,
    }
}

fn attribute_value(scalar: &Scalar) -> AttributeValue {
    match scalar.kind {
        AttributeKind::String => AttributeValue::S(scalar.value.clone()),
        AttributeKind::Number => AttributeValue::N(scalar.value.clone()),
        AttributeKind::Binary => AttributeValue::B(Blob::new(scalar.value.as_bytes())),
    }
}
