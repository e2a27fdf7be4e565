use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

use crate::committer::{WriteFailure, WriteResult};
use crate::config::CommitterConfig;
use crate::mapper::AttributeMap;
use crate::message::{Offset, PartitionId};
use crate::store::{StoreError, TableStore};

pub(super) enum CommitterMessage {
    Commit {
        partition: PartitionId,
        offset: Offset,
        item: AttributeMap,
        respond_to: oneshot::Sender<WriteResult>,
    },
    Flush {
        respond_to: oneshot::Sender<()>,
    },
}

/// Owns the store client and every in-flight write.
///
/// Writes to different keys run concurrently. Writes to the same key are chained in submission
/// order, retries included, so the item left in the store is the one submitted last.
pub(super) struct CommitterActor<S> {
    actor_messages: mpsc::Receiver<CommitterMessage>,
    store: S,
    table: Arc<str>,
    key_attributes: Vec<String>,
    config: Arc<CommitterConfig>,
    in_flight: JoinSet<()>,
    /// Completion signal of the latest write submitted for each key since the last drain.
    last_write: HashMap<String, oneshot::Receiver<()>>,
}

impl<S> CommitterActor<S>
where
    S: TableStore + Clone + Sync + 'static,
{
    pub(super) fn new(
        actor_messages: mpsc::Receiver<CommitterMessage>,
        store: S,
        table: Arc<str>,
        key_attributes: Vec<String>,
        config: CommitterConfig,
    ) -> Self {
        Self {
            actor_messages,
            store,
            table,
            key_attributes,
            config: Arc::new(config),
            in_flight: JoinSet::new(),
            last_write: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(msg) = self.actor_messages.recv().await {
            match msg {
                CommitterMessage::Commit {
                    partition,
                    offset,
                    item,
                    respond_to,
                } => self.submit(partition, offset, item, respond_to).await,
                CommitterMessage::Flush { respond_to } => {
                    self.drain().await;
                    let _ = respond_to.send(());
                }
            }
        }
        // every handle is gone, finish what was started before letting go of the store
        self.drain().await;
    }

    async fn submit(
        &mut self,
        partition: PartitionId,
        offset: Offset,
        item: AttributeMap,
        respond_to: oneshot::Sender<WriteResult>,
    ) {
        while let Some(finished) = self.in_flight.try_join_next() {
            log_join_failure(finished);
        }
        while self.in_flight.len() >= self.config.max_in_flight {
            if let Some(finished) = self.in_flight.join_next().await {
                log_join_failure(finished);
            }
        }

        // the sender is held until this write resolves, the next write to the key waits on it
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = self
            .last_write
            .insert(item_key(&self.key_attributes, &item), done_rx);

        let store = self.store.clone();
        let table = Arc::clone(&self.table);
        let config = Arc::clone(&self.config);
        self.in_flight.spawn(async move {
            let _done = done_tx;
            if let Some(previous) = previous {
                // resolves when the earlier write finishes or its task is gone
                let _ = previous.await;
            }
            let result = match write_item(&store, &table, &item, &config).await {
                Ok(()) => {
                    debug!(partition, offset, table = %table, "Item written");
                    WriteResult::Committed { partition, offset }
                }
                Err(cause) => {
                    warn!(partition, offset, table = %table, %cause, "Item write failed");
                    WriteResult::Failed {
                        partition,
                        offset,
                        cause,
                    }
                }
            };
            let _ = respond_to.send(result);
        });
    }

    async fn drain(&mut self) {
        while let Some(finished) = self.in_flight.join_next().await {
            log_join_failure(finished);
        }
        self.last_write.clear();
    }
}

/// Identity of the item a write replaces. Without declared key attributes every distinct item
/// is its own key.
fn item_key(key_attributes: &[String], item: &AttributeMap) -> String {
    if key_attributes.is_empty() {
        let mut fields: Vec<String> = item
            .iter()
            .map(|(name, scalar)| format!("{name}={}", scalar.value))
            .collect();
        fields.sort();
        return fields.join("\u{1f}");
    }
    key_attributes
        .iter()
        .map(|name| item.get(name).map_or("", |scalar| scalar.value.as_str()))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn log_join_failure(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(?e, "Write task failed");
    }
}

/// Writes one item, retrying transient failures until the retry budget runs out.
async fn write_item<S: TableStore + Sync>(
    store: &S,
    table: &str,
    item: &AttributeMap,
    config: &CommitterConfig,
) -> Result<(), WriteFailure> {
    let retry = &config.retry;
    let strategy = Exponential::new(
        retry.initial_interval,
        retry.max_interval,
        retry.factor,
        retry.jitter,
    )
    .max_retries(retry.max_attempts);

    let write_timeout = config.write_timeout;
    let attempt = move || async move { put_with_timeout(store, table, item, write_timeout).await };

    let mut writing = std::pin::pin!(Retry::new(strategy, attempt, StoreError::is_transient));
    let outcome = writing.as_mut().await;
    let attempts = writing.attempts();

    outcome.map_err(|e| {
        if e.is_transient() {
            WriteFailure::Exhausted {
                attempts,
                last_error: e.to_string(),
            }
        } else {
            WriteFailure::Rejected(e.to_string())
        }
    })
}

async fn put_with_timeout<S: TableStore + Sync>(
    store: &S,
    table: &str,
    item: &AttributeMap,
    write_timeout: Duration,
) -> Result<(), StoreError> {
    let result = match tokio::time::timeout(write_timeout, store.put_item(table, item)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::transient(format!(
            "write did not complete within {write_timeout:?}"
        ))),
    };
    if let Err(e) = &result {
        if e.is_transient() {
            debug!(table, error = %e, "Transient write failure");
        }
    }
    result
}
