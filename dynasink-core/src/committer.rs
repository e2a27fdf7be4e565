//! Issues one store write per accepted item and provides the flush barrier the pipeline
//! checkpoints against.
//!
//! Writes run concurrently on an actor owning the store client, bounded by `max_in_flight`.
//! Writes replacing the same key are applied in the order they were submitted.
//! Transient failures are retried locally with exponential backoff, every store call is bounded
//! by the write timeout. Each write resolves to exactly one [`WriteResult`].
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::CommitterConfig;
use crate::error::{Error, Result};
use crate::mapper::AttributeMap;
use crate::message::{Offset, PartitionId};
use crate::schema::TableSchema;
use crate::store::TableStore;

mod actor;

use actor::{CommitterActor, CommitterMessage};

/// Why a write did not make it to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    /// The store refused the item for good (validation, authorization).
    Rejected(String),
    /// Transient failures outlasted the retry budget.
    Exhausted { attempts: usize, last_error: String },
    /// The write task went away without reporting.
    Aborted(String),
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::Rejected(reason) => write!(f, "rejected: {reason}"),
            WriteFailure::Exhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            WriteFailure::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Committed {
        partition: PartitionId,
        offset: Offset,
    },
    Failed {
        partition: PartitionId,
        offset: Offset,
        cause: WriteFailure,
    },
}

impl WriteResult {
    pub fn partition(&self) -> PartitionId {
        match self {
            WriteResult::Committed { partition, .. } | WriteResult::Failed { partition, .. } => {
                *partition
            }
        }
    }

    pub fn offset(&self) -> Offset {
        match self {
            WriteResult::Committed { offset, .. } | WriteResult::Failed { offset, .. } => *offset,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, WriteResult::Committed { .. })
    }
}

/// A submitted write. Resolved once the write succeeded or failed for good.
#[derive(Debug)]
pub struct PendingWrite {
    partition: PartitionId,
    offset: Offset,
    result_rx: oneshot::Receiver<WriteResult>,
}

impl PendingWrite {
    pub async fn result(self) -> WriteResult {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => WriteResult::Failed {
                partition: self.partition,
                offset: self.offset,
                cause: WriteFailure::Aborted("write task dropped its result".to_string()),
            },
        }
    }
}

/// Handle to the committer actor. Owned by a single task.
pub struct Committer {
    actor_tx: mpsc::Sender<CommitterMessage>,
    flush_timeout: Duration,
    actor_handle: JoinHandle<()>,
}

impl Committer {
    /// Starts the actor. It owns `store` until [`Committer::shutdown`].
    pub fn start<S>(store: S, schema: &TableSchema, config: CommitterConfig) -> Self
    where
        S: TableStore + Clone + Sync + 'static,
    {
        let (actor_tx, actor_rx) = mpsc::channel(config.max_in_flight);
        let flush_timeout = config.flush_timeout;
        let actor = CommitterActor::new(
            actor_rx,
            store,
            Arc::from(schema.table()),
            schema.key_attributes().to_vec(),
            config,
        );
        let actor_handle = tokio::spawn(actor.run());
        Self {
            actor_tx,
            flush_timeout,
            actor_handle,
        }
    }

    /// Submits one item. Waits only when `max_in_flight` writes are already running.
    pub async fn commit(
        &self,
        partition: PartitionId,
        offset: Offset,
        item: AttributeMap,
    ) -> Result<PendingWrite> {
        let (respond_to, result_rx) = oneshot::channel();
        self.actor_tx
            .send(CommitterMessage::Commit {
                partition,
                offset,
                item,
                respond_to,
            })
            .await
            .map_err(|_| Error::Transport("committer is not running".to_string()))?;
        Ok(PendingWrite {
            partition,
            offset,
            result_rx,
        })
    }

    /// Returns once every previously submitted write has resolved. Not completing within the
    /// flush timeout is a fatal transport failure.
    pub async fn flush(&self) -> Result<()> {
        let barrier = async {
            let (respond_to, done) = oneshot::channel();
            self.actor_tx
                .send(CommitterMessage::Flush { respond_to })
                .await
                .map_err(|_| Error::Transport("committer is not running".to_string()))?;
            done.await
                .map_err(|e| Error::ActorPatternRecv(format!("flush barrier dropped: {e}")))
        };

        tokio::time::timeout(self.flush_timeout, barrier)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "flush did not complete within {:?}",
                    self.flush_timeout
                ))
            })?
    }

    /// Waits for in-flight writes, then stops the actor and releases the store client.
    pub async fn shutdown(self) -> Result<()> {
        let flushed = self.flush().await;
        drop(self.actor_tx);
        if let Err(e) = self.actor_handle.await {
            error!(?e, "Committer actor failed");
        }
        info!("Committer stopped");
        flushed
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::config::RetryConfig;
    use crate::mapper::Scalar;
    use crate::schema::AttributeKind;
    use crate::store::{StoreError, TableDescriptor};
    use crate::test_utils::InMemoryStore;

    fn config() -> CommitterConfig {
        CommitterConfig {
            write_timeout: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(10),
            max_in_flight: 4,
            retry: RetryConfig {
                max_attempts: 3,
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(40),
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::with_table(
            "orders",
            &[("id", AttributeKind::String), ("name", AttributeKind::String)],
        )
    }

    fn schema() -> TableSchema {
        TableSchema::from_descriptor(TableDescriptor {
            table: "orders".to_string(),
            attributes: vec![
                ("id".to_string(), AttributeKind::String),
                ("name".to_string(), AttributeKind::String),
            ],
            key_attributes: vec!["id".to_string()],
        })
        .unwrap()
    }

    fn item(id: &str) -> AttributeMap {
        named_item(id, "x")
    }

    fn named_item(id: &str, name: &str) -> AttributeMap {
        AttributeMap::from([
            ("id".to_string(), Scalar::new(AttributeKind::String, id)),
            ("name".to_string(), Scalar::new(AttributeKind::String, name)),
        ])
    }

    #[test(tokio::test)]
    async fn commits_every_item() {
        let store = store();
        let committer = Committer::start(store.clone(), &schema(), config());

        let mut pending = Vec::new();
        for offset in 0..10 {
            pending.push(
                committer
                    .commit(0, offset, item(&offset.to_string()))
                    .await
                    .unwrap(),
            );
        }
        committer.flush().await.unwrap();

        for (offset, write) in pending.into_iter().enumerate() {
            assert_eq!(
                write.result().await,
                WriteResult::Committed {
                    partition: 0,
                    offset: offset as Offset,
                }
            );
        }
        assert_eq!(store.item_count("orders"), 10);
        committer.shutdown().await.unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn transient_failures_are_retried() {
        let store = store();
        store.fail_puts(
            "1",
            vec![StoreError::transient("throttled"), StoreError::transient("throttled")],
        );
        let committer = Committer::start(store.clone(), &schema(), config());

        let write = committer.commit(0, 7, item("1")).await.unwrap();
        committer.flush().await.unwrap();

        assert!(write.result().await.is_committed());
        assert_eq!(store.put_calls(), 3);
        assert!(store.item("orders", "1").is_some());
    }

    #[test(tokio::test(start_paused = true))]
    async fn retry_budget_is_bounded() {
        let store = store();
        store.fail_puts("1", vec![StoreError::transient("throttled"); 10]);
        let committer = Committer::start(store.clone(), &schema(), config());

        let write = committer.commit(2, 7, item("1")).await.unwrap();
        committer.flush().await.unwrap();

        match write.result().await {
            WriteResult::Failed {
                partition: 2,
                offset: 7,
                cause: WriteFailure::Exhausted { attempts, .. },
            } => assert_eq!(attempts, 4),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(store.put_calls(), 4);
    }

    #[test(tokio::test)]
    async fn permanent_failures_are_not_retried() {
        let store = store();
        store.fail_puts("1", vec![StoreError::permanent("ValidationException")]);
        let committer = Committer::start(store.clone(), &schema(), config());

        let rejected = committer.commit(0, 1, item("1")).await.unwrap();
        let committed = committer.commit(0, 2, item("2")).await.unwrap();
        committer.flush().await.unwrap();

        assert!(matches!(
            rejected.result().await,
            WriteResult::Failed {
                cause: WriteFailure::Rejected(_),
                ..
            }
        ));
        assert!(committed.result().await.is_committed());
        assert_eq!(store.put_calls(), 2);
    }

    #[test(tokio::test(start_paused = true))]
    async fn slow_writes_time_out() {
        let store = store();
        store.set_put_delay(Duration::from_secs(30));
        let mut config = config();
        config.retry.max_attempts = 1;
        let committer = Committer::start(store.clone(), &schema(), config);

        let write = committer.commit(0, 1, item("1")).await.unwrap();
        committer.flush().await.unwrap();

        assert!(matches!(
            write.result().await,
            WriteResult::Failed {
                cause: WriteFailure::Exhausted { attempts: 2, .. },
                ..
            }
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn flush_past_its_deadline_is_fatal() {
        let store = store();
        store.set_put_delay(Duration::from_secs(30));
        let mut config = config();
        config.write_timeout = Duration::from_secs(120);
        config.flush_timeout = Duration::from_secs(5);
        let committer = Committer::start(store.clone(), &schema(), config);

        let _write = committer.commit(0, 1, item("1")).await.unwrap();
        assert!(matches!(committer.flush().await, Err(Error::Transport(_))));
    }

    #[test(tokio::test)]
    async fn more_writes_than_in_flight_slots() {
        let store = store();
        let mut config = config();
        config.max_in_flight = 1;
        let committer = Committer::start(store.clone(), &schema(), config);

        let mut pending = Vec::new();
        for offset in 0..5 {
            pending.push(committer.commit(0, offset, item(&offset.to_string())).await.unwrap());
        }
        committer.shutdown().await.unwrap();

        for write in pending {
            assert!(write.result().await.is_committed());
        }
        assert_eq!(store.item_count("orders"), 5);
    }

    #[test(tokio::test)]
    async fn flush_with_nothing_submitted_returns() {
        let committer = Committer::start(store(), &schema(), config());
        committer.flush().await.unwrap();
        committer.shutdown().await.unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn later_write_to_a_key_wins_over_a_retried_one() {
        let store = store();
        store.fail_puts("1", vec![StoreError::transient("throttled")]);
        let mut config = config();
        config.max_in_flight = 16;
        let committer = Committer::start(store.clone(), &schema(), config);

        let older = committer.commit(0, 0, named_item("1", "old")).await.unwrap();
        let newer = committer.commit(0, 1, named_item("1", "new")).await.unwrap();
        committer.flush().await.unwrap();

        assert!(older.result().await.is_committed());
        assert!(newer.result().await.is_committed());
        assert_eq!(store.item("orders", "1").unwrap()["name"].value, "new");
        assert_eq!(store.put_calls(), 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn same_key_waits_even_when_the_earlier_write_fails() {
        let store = store();
        store.fail_puts("1", vec![StoreError::transient("throttled"); 4]);
        let committer = Committer::start(store.clone(), &schema(), config());

        let older = committer.commit(0, 0, named_item("1", "old")).await.unwrap();
        let newer = committer.commit(1, 9, named_item("1", "new")).await.unwrap();
        committer.flush().await.unwrap();

        assert!(matches!(
            older.result().await,
            WriteResult::Failed {
                cause: WriteFailure::Exhausted { attempts: 4, .. },
                ..
            }
        ));
        assert!(newer.result().await.is_committed());
        assert_eq!(store.item("orders", "1").unwrap()["name"].value, "new");
    }

    #[test(tokio::test(start_paused = true))]
    async fn other_keys_do_not_wait_for_a_retrying_write() {
        let store = store();
        store.fail_puts("1", vec![StoreError::transient("throttled"); 3]);
        store.set_put_delay(Duration::from_millis(1));
        let committer = Committer::start(store.clone(), &schema(), config());

        let start = tokio::time::Instant::now();
        let slow = committer.commit(0, 0, item("1")).await.unwrap();
        let fast = committer.commit(0, 1, item("2")).await.unwrap();

        assert!(fast.result().await.is_committed());
        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(slow.result().await.is_committed());
    }
}
