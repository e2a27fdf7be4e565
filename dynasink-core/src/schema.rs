//! Discovers the target table's attributes once per task and keeps them as an immutable,
//! shared [`TableSchema`].
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::store::{StoreErrorKind, TableDescriptor, TableStore};

/// Scalar kind the store declares for an attribute. It only decides how a value is tagged on
/// the wire, values are never parsed or validated against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttributeKind {
    #[default]
    String,
    Number,
    Binary,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeKind::String => write!(f, "S"),
            AttributeKind::Number => write!(f, "N"),
            AttributeKind::Binary => write!(f, "B"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    /// Index of the payload field carrying this attribute.
    pub position: usize,
    pub kind: AttributeKind,
}

/// Ordered attributes of the target table. Positions are contiguous from 0 and names are unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    attributes: Vec<AttributeSpec>,
    key_attributes: Vec<String>,
}

impl TableSchema {
    /// Builds a schema from the store's attribute list, in the order the store reports it.
    pub fn from_descriptor(descriptor: TableDescriptor) -> Result<Self> {
        let TableDescriptor {
            table,
            attributes,
            key_attributes,
        } = descriptor;

        if attributes.is_empty() {
            return Err(Error::SchemaUnavailable(format!(
                "table {table} declares no attributes"
            )));
        }

        let mut seen = HashSet::with_capacity(attributes.len());
        let mut specs = Vec::with_capacity(attributes.len());
        for (position, (name, kind)) in attributes.into_iter().enumerate() {
            if !seen.insert(name.clone()) {
                return Err(Error::SchemaUnavailable(format!(
                    "table {table} declares attribute {name} more than once"
                )));
            }
            specs.push(AttributeSpec {
                name,
                position,
                kind,
            });
        }

        Ok(Self {
            table,
            attributes: specs,
            key_attributes,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    /// Primary key attribute names as declared by the store.
    pub fn key_attributes(&self) -> &[String] {
        &self.key_attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

pub struct SchemaRegistry;

impl SchemaRegistry {
    /// Fetches the schema of `table`. Called once when a task starts, the result is never
    /// refreshed.
    pub async fn load<S: TableStore>(store: &S, table: &str) -> Result<Arc<TableSchema>> {
        if table.trim().is_empty() {
            return Err(Error::Config("table identifier must not be empty".to_string()));
        }

        let descriptor = store.describe_table(table).await.map_err(|e| match e.kind {
            StoreErrorKind::NotFound => {
                Error::SchemaUnavailable(format!("table {table} does not exist"))
            }
            _ => Error::SchemaUnavailable(format!("describing table {table}: {e}")),
        })?;

        let schema = TableSchema::from_descriptor(descriptor)?;
        info!(
            table,
            attributes = ?schema.attributes().iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            keys = ?schema.key_attributes(),
            "Loaded table schema"
        );
        Ok(Arc::new(schema))
    }
}
