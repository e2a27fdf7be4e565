use std::collections::HashMap;

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{AttributeValue, TableDescription};

use crate::{Error, Result, is_transient_code};

/// Thin handle over a DynamoDB client. Cloning is cheap and shares the underlying connection
/// pool.
#[derive(Clone, Debug)]
pub struct DynamoTable {
    client: Client,
}

impl DynamoTable {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches the table description, including its attribute definitions and key schema.
    pub async fn describe(&self, table_name: &str) -> Result<TableDescription> {
        let output = self
            .client
            .describe_table()
            .table_name(table_name)
            .send()
            .await
            .map_err(|err| describe_error(table_name, &err))?;

        output
            .table
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))
    }

    /// Writes a whole item, replacing any existing item with the same key.
    pub async fn put(&self, table_name: &str, item: HashMap<String, AttributeValue>) -> Result<()> {
        self.client
            .put_item()
            .table_name(table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|err| put_error(&err))?;
        Ok(())
    }
}

fn describe_error<R>(table_name: &str, err: &SdkError<DescribeTableError, R>) -> Error
where
    R: std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(ctx) => {
            let service_err = ctx.err();
            if service_err.is_resource_not_found_exception() {
                Error::TableNotFound(table_name.to_string())
            } else if service_err.is_internal_server_error()
                || is_transient_code(service_err.code())
            {
                Error::Transient(service_message(service_err))
            } else {
                Error::Rejected(service_message(service_err))
            }
        }
        other => transport_error(other),
    }
}

fn put_error<R>(err: &SdkError<PutItemError, R>) -> Error
where
    R: std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(ctx) => {
            let service_err = ctx.err();
            if service_err.is_provisioned_throughput_exceeded_exception()
                || service_err.is_request_limit_exceeded()
                || service_err.is_internal_server_error()
                || service_err.is_transaction_conflict_exception()
                || is_transient_code(service_err.code())
            {
                Error::Transient(service_message(service_err))
            } else {
                Error::Rejected(service_message(service_err))
            }
        }
        other => transport_error(other),
    }
}

/// Errors that never reached a modeled service response. Timeouts, dispatch and response
/// failures are worth another attempt; a request that could not be built is not.
fn transport_error<E, R>(err: &SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::Transient(message)
        }
        _ => Error::Other(message),
    }
}

fn service_message<E: ProvideErrorMetadata>(err: &E) -> String {
    format!(
        "{}: {}",
        err.code().unwrap_or("Unknown"),
        err.message().unwrap_or("no message")
    )
}
