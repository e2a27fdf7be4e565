use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Task level errors. Everything here is fatal for the task raising it, per-record problems are
/// reported as values ([`crate::mapper::Rejection`], [`crate::committer::WriteFailure`]).
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Schema Unavailable - {0}")]
    SchemaUnavailable(String),

    /// The flush barrier could not complete.
    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Store Error - {0}")]
    Store(String),

    /// A task ended without reporting, it panicked or was aborted.
    #[error("Task Error - {0}")]
    Task(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl From<dynasink_kafka::Error> for Error {
    fn from(value: dynasink_kafka::Error) -> Self {
        match value {
            dynasink_kafka::Error::InvalidConfig(msg) => Error::Config(msg),
            other => Error::Source(other.to_string()),
        }
    }
}

impl From<dynasink_dynamodb::Error> for Error {
    fn from(value: dynasink_dynamodb::Error) -> Self {
        match value {
            dynasink_dynamodb::Error::InvalidConfig(msg) => Error::Config(msg),
            other => Error::Store(other.to_string()),
        }
    }
}
