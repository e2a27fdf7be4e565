//! DynamoDB plumbing for the sink: client construction and the two calls the sink needs,
//! `DescribeTable` and `PutItem`.
//!
//! SDK errors are flattened into [`Error`] and classified so callers can tell a missing table,
//! a transient failure worth retrying, and a permanent rejection apart.
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client;

pub mod table;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Error codes DynamoDB returns for conditions that clear up on their own.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "InternalServerError",
    "LimitExceededException",
    "ProvisionedThroughputExceededException",
    "ReplicatedWriteConflictException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ThrottlingException",
    "TransactionConflictException",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Transient DynamoDB failure - {0}")]
    Transient(String),

    #[error("DynamoDB rejected the request - {0}")]
    Rejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Connection settings for the DynamoDB client. Credentials come from the default provider
/// chain.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamoConfig {
    pub region: String,
    /// Overrides the regional endpoint, e.g. for DynamoDB Local.
    pub endpoint_url: Option<String>,
    /// Upper bound for a single attempt of any call.
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
}

impl DynamoConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(Error::InvalidConfig("region must not be empty".to_string()));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.endpoint_url {
            if endpoint.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "endpoint url must not be blank when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

pub fn aws_behavior_version() -> BehaviorVersion {
    BehaviorVersion::latest()
}

/// Creates a DynamoDB client for the configured region.
///
/// The SDK's own retries are turned off; the sink retries transient failures itself so that
/// every attempt is visible and bounded by its own policy.
pub async fn create_client(config: &DynamoConfig) -> Result<Client> {
    config.validate()?;

    tracing::info!(region = %config.region, endpoint = ?config.endpoint_url, "Creating DynamoDB client");

    let timeouts = TimeoutConfig::builder()
        .operation_attempt_timeout(config.call_timeout)
        .connect_timeout(config.connect_timeout)
        .build();

    let mut loader = aws_config::defaults(aws_behavior_version())
        .region(Region::new(config.region.clone()))
        .timeout_config(timeouts)
        .retry_config(RetryConfig::disabled());

    if let Some(endpoint_url) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    let shared_config = loader.load().await;
    Ok(Client::new(&shared_config))
}

fn is_transient_code(code: Option<&str>) -> bool {
    code.is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code))
}
