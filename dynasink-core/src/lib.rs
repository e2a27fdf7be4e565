//! Streams records from a Kafka topic into a DynamoDB table.
//!
//! Every task runs the same loop:
//! - read a batch of records from the topic
//! - map each comma delimited payload onto the table's attributes, skipping records that do not
//!   fit
//! - write the accepted items and wait for all writes to resolve
//! - acknowledge, per partition, everything up to the first record that could not be written,
//!   and rewind to that record so it is delivered again
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use self::error::{Error, Result};

mod error;

pub mod checkpoint;
pub mod committer;
pub mod config;
pub mod connector;
pub mod mapper;
pub mod message;
pub mod pipeline;
pub mod runtime;
pub mod schema;
pub mod source;
pub mod store;
pub mod task;

#[cfg(test)]
mod test_utils;

/// Loads the settings from the environment and runs until SIGINT/SIGTERM or a fatal task error.
pub async fn run() -> Result<()> {
    let settings = config::Settings::from_env()?;
    info!(
        table = %settings.table,
        topic = %settings.kafka.topic,
        tasks = settings.max_tasks,
        version = connector::VERSION,
        "Starting sink"
    );

    let cancel = CancellationToken::new();
    let shutdown_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down, waiting for in-flight writes");
            cancel.cancel();
        }
    });

    let result = runtime::start(settings, cancel).await;
    shutdown_handle.abort();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
