//! Runs the sink tasks: one read, write, acknowledge loop per task until shutdown.
use std::collections::HashMap;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use dynasink_dynamodb::DynamoConfig;
use dynasink_dynamodb::table::DynamoTable;
use dynasink_kafka::source::KafkaSource;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::connector::{Connector, TaskConfig};
use crate::error::{Error, Result};
use crate::message::{Offset, PartitionId};
use crate::source::RecordSource;
use crate::task::SinkTask;

const REDELIVERY_INITIAL_PAUSE: Duration = Duration::from_millis(100);
const REDELIVERY_MAX_PAUSE: Duration = Duration::from_secs(10);

/// Starts `max_tasks` tasks and waits for all of them. The first fatal error cancels the
/// remaining tasks and is returned.
pub async fn start(settings: Settings, cancel: CancellationToken) -> Result<()> {
    let connector = Connector::start(&settings.connector_props())?;

    let mut tasks = JoinSet::new();
    for (index, props) in connector
        .task_configs(settings.max_tasks)
        .into_iter()
        .enumerate()
    {
        let settings = settings.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { run_instance(index, props, settings, cancel).await });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| Err(task_failure(e)));
        if let Err(e) = outcome {
            error!(error = %e, "Sink task failed, stopping the others");
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    info!(version = connector.version(), "All sink tasks stopped");
    result
}

fn task_failure(e: JoinError) -> Error {
    if e.is_panic() {
        Error::Task(format!("sink task panicked: {e}"))
    } else {
        Error::Task(format!("sink task was cancelled: {e}"))
    }
}

/// Builds the store client, task and consumer of one task instance, then runs it.
async fn run_instance(
    index: usize,
    props: HashMap<String, String>,
    settings: Settings,
    cancel: CancellationToken,
) -> Result<()> {
    let task_config = TaskConfig::from_props(&props)?;
    let mut dynamo = DynamoConfig::new(task_config.region);
    dynamo.endpoint_url = settings.endpoint_url.clone();
    dynamo.call_timeout = settings.committer.write_timeout;
    let client = dynasink_dynamodb::create_client(&dynamo).await?;

    let task = SinkTask::start(&props, DynamoTable::new(client), settings.committer.clone()).await?;

    let source = match KafkaSource::connect(
        settings.kafka.clone(),
        settings.batch_size,
        settings.read_timeout,
        cancel.clone(),
    ) {
        Ok(source) => source,
        Err(e) => {
            if let Err(stop_err) = task.stop().await {
                warn!(task = index, error = %stop_err, "Failed to stop task");
            }
            return Err(e.into());
        }
    };

    info!(task = index, topic = %settings.kafka.topic, "Sink task started");
    run_task(task, source, cancel).await
}

/// Read, write, acknowledge until cancelled, then stop the task.
///
/// Acknowledgment failures are logged and retried implicitly by the next batch. A partition
/// with an unresolved record is rewound to it and paused with its own growing backoff, the
/// other partitions keep flowing. Revoked partitions are forgotten.
pub async fn run_task<S: RecordSource>(
    mut task: SinkTask,
    mut source: S,
    cancel: CancellationToken,
) -> Result<()> {
    let mut redelivery = Redelivery::default();

    let result = loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            batch = source.read() => batch,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => break Err(e),
        };

        redelivery.resume_due(&mut source).await;

        // a revoked partition may already be assigned again, its records in this batch then
        // start at the upstream committed offset
        let revoked = match source.revoked().await {
            Ok(revoked) => revoked,
            Err(e) => break Err(e),
        };
        for partition in revoked {
            info!(partition, "Partition revoked, dropping its checkpoint");
            task.forget(partition);
            redelivery.clear(partition);
        }
        if batch.is_empty() {
            continue;
        }

        let frontier = match task.put(batch).await {
            Ok(frontier) => frontier,
            Err(e) => break Err(e),
        };

        if let Err(e) = source.ack(&frontier).await {
            warn!(error = %e, acknowledged = ?frontier.acknowledged(), "Failed to acknowledge offsets");
        }

        for partition in frontier.acknowledged().keys() {
            if !frontier.redeliver_from().contains_key(partition) {
                redelivery.clear(*partition);
            }
        }
        if !frontier.is_stalled() {
            continue;
        }
        for (partition, offset) in frontier.redeliver_from() {
            redelivery.stall(&mut source, *partition, *offset).await;
        }
    };

    let stopped = task.stop().await;
    result.and(stopped)
}

struct StalledPartition {
    backoff: Exponential,
    /// Set while the partition is paused.
    resume_at: Option<Instant>,
}

/// Redelivery pace of every stalled partition. An entry lives until its partition makes
/// progress or is revoked.
#[derive(Default)]
struct Redelivery {
    stalled: HashMap<PartitionId, StalledPartition>,
}

impl Redelivery {
    /// Rewinds `partition` to `offset` and pauses it for the next step of its backoff.
    async fn stall<S: RecordSource>(
        &mut self,
        source: &mut S,
        partition: PartitionId,
        offset: Offset,
    ) {
        let stalled = self
            .stalled
            .entry(partition)
            .or_insert_with(|| StalledPartition {
                backoff: Exponential::new(REDELIVERY_INITIAL_PAUSE, REDELIVERY_MAX_PAUSE, 2.0, 0.1),
                resume_at: None,
            });

        if let Err(e) = source.rewind(partition, offset).await {
            warn!(partition, offset, error = %e, "Failed to rewind partition");
        }
        let pause = stalled.backoff.next().unwrap_or(REDELIVERY_MAX_PAUSE);
        match source.pause(&[partition]).await {
            Ok(()) => {
                stalled.resume_at = Some(Instant::now() + pause);
                warn!(partition, offset, ?pause, "Rewound partition to redeliver unwritten records");
            }
            Err(e) => warn!(partition, error = %e, "Failed to pause partition"),
        }
    }

    /// Resumes the partitions whose pause is over.
    async fn resume_due<S: RecordSource>(&mut self, source: &mut S) {
        let now = Instant::now();
        let due: Vec<PartitionId> = self
            .stalled
            .iter()
            .filter(|(_, stalled)| stalled.resume_at.is_some_and(|at| at <= now))
            .map(|(partition, _)| *partition)
            .collect();
        if due.is_empty() {
            return;
        }

        match source.resume(&due).await {
            Ok(()) => {
                for partition in &due {
                    if let Some(stalled) = self.stalled.get_mut(partition) {
                        stalled.resume_at = None;
                    }
                }
                debug!(partitions = ?due, "Resumed partitions for redelivery");
            }
            // still due, tried again after the next read
            Err(e) => warn!(partitions = ?due, error = %e, "Failed to resume partitions"),
        }
    }

    fn clear(&mut self, partition: PartitionId) {
        self.stalled.remove(&partition);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::config::{CommitterConfig, RetryConfig};
    use crate::connector::{DYNAMODB_REGION, DYNAMODB_TABLE};
    use crate::schema::AttributeKind;
    use crate::store::StoreError;
    use crate::test_utils::{InMemorySource, InMemoryStore};

    fn props() -> HashMap<String, String> {
        HashMap::from([
            (DYNAMODB_TABLE.to_string(), "orders".to_string()),
            (DYNAMODB_REGION.to_string(), "eu-west-1".to_string()),
        ])
    }

    fn config() -> CommitterConfig {
        CommitterConfig {
            retry: RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            },
            ..CommitterConfig::default()
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::with_table(
            "orders",
            &[("id", AttributeKind::String), ("name", AttributeKind::String)],
        )
    }

    async fn wait_for_commit(source: &InMemorySource, partition: i32, next_offset: i64) {
        wait_for_commit_within(source, partition, next_offset, Duration::from_secs(5)).await;
    }

    async fn wait_for_commit_within(
        source: &InMemorySource,
        partition: i32,
        next_offset: i64,
        within: Duration,
    ) {
        tokio::time::timeout(within, async {
            while source.committed(partition) != Some(next_offset) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offsets were not committed in time");
    }

    async fn wait_for_rewind(source: &InMemorySource) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.rewinds().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no partition was rewound in time");
    }

    #[test(tokio::test)]
    async fn consumes_and_acknowledges_every_partition() {
        let store = store();
        let source = InMemorySource::new(2);
        source.append(0, &["1,a", "2,b", "broken", "3,c"]);
        source.append(1, &["4,d"]);

        let task = SinkTask::start(&props(), store.clone(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, source.clone(), cancel.clone()));

        wait_for_commit(&source, 0, 4).await;
        wait_for_commit(&source, 1, 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.item_count("orders"), 4);
        assert!(source.rewinds().is_empty());
    }

    #[test(tokio::test)]
    async fn failed_write_is_redelivered() {
        let store = store();
        store.fail_puts("2", vec![StoreError::transient("throttled")]);
        let source = InMemorySource::new(10);
        source.append(0, &["1,a", "2,b", "3,c"]);

        let task = SinkTask::start(&props(), store.clone(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, source.clone(), cancel.clone()));

        wait_for_commit(&source, 0, 3).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(source.rewinds(), vec![(0, 1)]);
        assert_eq!(store.item("orders", "2").unwrap()["name"].value, "b");
    }

    #[test(tokio::test)]
    async fn healthy_partitions_keep_flowing_while_one_is_stalled() {
        let store = store();
        store.fail_puts("x", vec![StoreError::permanent("ValidationException"); 1000]);
        let source = InMemorySource::new(10);
        source.append(0, &["x,a"]);
        source.append(1, &["1,a"]);

        let task = SinkTask::start(&props(), store.clone(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, source.clone(), cancel.clone()));

        wait_for_commit(&source, 1, 1).await;
        // long enough for partition 0 to go through a few redeliveries
        tokio::time::sleep(Duration::from_millis(400)).await;
        for (next_offset, payload) in [(2, "2,b"), (3, "3,c"), (4, "4,d")] {
            source.append(1, &[payload]);
            wait_for_commit_within(&source, 1, next_offset, Duration::from_millis(200)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(source.committed(0), None);
        let rewinds = source.rewinds();
        assert!(rewinds.iter().all(|rewind| *rewind == (0, 0)), "{rewinds:?}");
        // 100ms, 200ms, 400ms... between redeliveries
        assert!((1..6).contains(&rewinds.len()), "{rewinds:?}");
    }

    #[test(tokio::test)]
    async fn reassigned_partition_starts_from_the_committed_offset() {
        let store = store();
        store.fail_puts("x", vec![StoreError::permanent("ValidationException"); 1000]);
        let source = InMemorySource::new(10);
        source.append(0, &["x,a", "1,a", "2,b", "3,c"]);

        let task = SinkTask::start(&props(), store.clone(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, source.clone(), cancel.clone()));

        wait_for_rewind(&source).await;
        // another consumer got past the stalled record while the partition was away
        source.revoke(0);
        source.reassign(0, 3);
        wait_for_commit(&source, 0, 4).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(source.rewinds(), vec![(0, 0)]);
        assert_eq!(store.item("orders", "3").unwrap()["name"].value, "c");
    }

    #[test(tokio::test)]
    async fn ack_failures_are_not_fatal() {
        let store = store();
        let source = InMemorySource::new(10);
        source.fail_acks(true);
        source.append(0, &["1,a"]);

        let task = SinkTask::start(&props(), store.clone(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, source.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.fail_acks(false);
        source.append(0, &["2,b"]);
        wait_for_commit(&source, 0, 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(store.item_count("orders"), 2);
    }

    #[test(tokio::test)]
    async fn cancel_stops_an_idle_task() {
        let task = SinkTask::start(&props(), store(), config()).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(task, InMemorySource::new(10), cancel.clone()));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[test(tokio::test)]
    async fn invalid_settings_fail_before_any_task_starts() {
        let mut settings = Settings::load([
            ("DYNASINK_TABLE", "orders"),
            ("DYNASINK_REGION", "eu-west-1"),
            ("DYNASINK_KAFKA_BROKERS", "localhost:9092"),
            ("DYNASINK_KAFKA_TOPIC", "orders"),
        ])
        .unwrap();
        settings.region = String::new();

        let result = start(settings, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    async fn explode() {
        panic!("boom")
    }

    #[test(tokio::test)]
    async fn panicked_task_is_a_task_error() {
        let handle = tokio::spawn(explode());
        let err = handle.await.unwrap_err();
        assert!(matches!(task_failure(err), Error::Task(msg) if msg.contains("panicked")));
    }
}
