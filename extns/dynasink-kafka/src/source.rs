use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaSourceConfig, Result};

/// Consecutive receive failures tolerated before a read gives up.
const MAX_CONSECUTIVE_FAILURES: usize = 10;
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// A record read from the topic.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub partition: i32,
    pub offset: i64,
    /// Record value. Tombstones (no value) are returned as empty bytes.
    pub value: Bytes,
}

// Rebalance callbacks are served while polling. Revoked partitions are handed to the actor so
// the owner of the handle can drop its state for them.
struct SinkConsumerContext {
    revoked_tx: mpsc::UnboundedSender<i32>,
}

impl ClientContext for SinkConsumerContext {}

impl ConsumerContext for SinkConsumerContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Pre rebalance");
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Post rebalance");
        if let Rebalance::Revoke(tpl) = rebalance {
            for elem in tpl.elements() {
                let _ = self.revoked_tx.send(elem.partition());
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(?offsets, "Committed offsets"),
            Err(e) => warn!(?e, ?offsets, "Offset commit failed"),
        }
    }
}

type SinkConsumer = StreamConsumer<SinkConsumerContext>;

enum ActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Vec<KafkaMessage>>>,
    },
    Ack {
        offsets: Vec<(i32, i64)>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Rewind {
        partition: i32,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pause {
        partitions: Vec<i32>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Resume {
        partitions: Vec<i32>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Revoked {
        respond_to: oneshot::Sender<Vec<i32>>,
    },
}

struct KafkaActor {
    consumer: Arc<SinkConsumer>,
    topic: String,
    batch_size: usize,
    read_timeout: Duration,
    handler_rx: mpsc::Receiver<ActorMessage>,
    revoked_rx: mpsc::UnboundedReceiver<i32>,
    cancel_token: CancellationToken,
}

impl KafkaActor {
    fn start(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<ActorMessage>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        config.validate()?;

        let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
        let consumer: SinkConsumer = config
            .client_config()
            .create_with_context(SinkConsumerContext { revoked_tx })
            .map_err(|err| Error::Connection {
                server: config.brokers.join(","),
                error: err.to_string(),
            })?;

        // subscribing to a topic that does not exist yet is not an error, reads start once it
        // shows up
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let actor = KafkaActor {
            consumer: Arc::new(consumer),
            topic: config.topic,
            batch_size,
            read_timeout,
            handler_rx,
            revoked_rx,
            cancel_token,
        };

        tokio::spawn(async move {
            info!(topic = %actor.topic, "Starting Kafka consumer");
            actor.run().await;
        });
        Ok(())
    }

    // returns once every handle to the actor is dropped
    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
        info!(topic = %self.topic, "Kafka consumer stopped");
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                if respond_to.send(messages).is_err() {
                    error!("Read requester went away before receiving messages");
                }
            }
            ActorMessage::Ack {
                offsets,
                respond_to,
            } => {
                let status = self.ack_messages(offsets).await;
                let _ = respond_to.send(status);
            }
            ActorMessage::Rewind {
                partition,
                offset,
                respond_to,
            } => {
                let status = self.rewind(partition, offset).await;
                let _ = respond_to.send(status);
            }
            ActorMessage::Pause {
                partitions,
                respond_to,
            } => {
                let status = self
                    .consumer
                    .pause(&self.partition_list(&partitions))
                    .map_err(|e| {
                        Error::Kafka(format!("Failed to pause partitions {partitions:?}: {e}"))
                    });
                let _ = respond_to.send(status);
            }
            ActorMessage::Resume {
                partitions,
                respond_to,
            } => {
                let status = self
                    .consumer
                    .resume(&self.partition_list(&partitions))
                    .map_err(|e| {
                        Error::Kafka(format!("Failed to resume partitions {partitions:?}: {e}"))
                    });
                let _ = respond_to.send(status);
            }
            ActorMessage::Revoked { respond_to } => {
                let _ = respond_to.send(self.revoked_partitions());
            }
        }
    }

    /// Partitions revoked since the last call, each reported once.
    fn revoked_partitions(&mut self) -> Vec<i32> {
        let mut revoked = Vec::new();
        while let Ok(partition) = self.revoked_rx.try_recv() {
            if !revoked.contains(&partition) {
                revoked.push(partition);
            }
        }
        if !revoked.is_empty() {
            info!(?revoked, "Partitions revoked");
        }
        revoked
    }

    fn partition_list(&self, partitions: &[i32]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(&self.topic, *partition);
        }
        tpl
    }

    /// Reads until the batch is full, the read timeout fires, or shutdown starts.
    async fn read_messages(&mut self) -> Result<Vec<KafkaMessage>> {
        let mut messages = Vec::with_capacity(self.batch_size);
        let deadline = tokio::time::sleep(self.read_timeout);
        tokio::pin!(deadline);

        let mut consecutive_failures = 0;
        while messages.len() < self.batch_size {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => break,

                _ = &mut deadline => break,

                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => {
                            consecutive_failures = 0;
                            message
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                                return Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_CONSECUTIVE_FAILURES} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read message, retrying in 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    messages.push(KafkaMessage {
                        partition: message.partition(),
                        offset: message.offset(),
                        value: message
                            .payload()
                            .map(Bytes::copy_from_slice)
                            .unwrap_or_default(),
                    });
                }
            }
        }
        debug!(count = messages.len(), "Read messages from Kafka");
        Ok(messages)
    }

    /// Commits the given offsets. A committed offset is the next one to read, so `offset + 1` is
    /// sent for every acknowledged record.
    async fn ack_messages(&mut self, offsets: Vec<(i32, i64)>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        }

        // commit may block on the broker round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Commit task failed: {e:?}")))?
    }

    /// Moves the fetch position of a partition back so `offset` is delivered again.
    async fn rewind(&mut self, partition: i32, offset: i64) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .seek(&topic, partition, Offset::Offset(offset), METADATA_TIMEOUT)
                .map_err(|e| {
                    Error::Kafka(format!(
                        "Failed to seek partition {partition} to offset {offset}: {e}"
                    ))
                })
        })
        .await
        .map_err(|e| Error::Other(format!("Seek task failed: {e:?}")))?
    }
}

/// Handle to the consumer actor.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<ActorMessage>,
}

impl KafkaSource {
    pub fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, read_timeout, rx, cancel_token)?;
        Ok(Self { actor_tx: tx })
    }

    pub async fn read_messages(&self) -> Result<Vec<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Read { respond_to: tx }).await?;
        rx.await.map_err(|_| actor_terminated())?
    }

    /// Commits the highest processed offset of each partition.
    pub async fn ack_messages(&self, offsets: Vec<(i32, i64)>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Ack {
            offsets,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_terminated())?
    }

    pub async fn rewind(&self, partition: i32, offset: i64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Rewind {
            partition,
            offset,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_terminated())?
    }

    /// Stops fetching from `partitions` until they are resumed.
    pub async fn pause(&self, partitions: Vec<i32>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Pause {
            partitions,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_terminated())?
    }

    pub async fn resume(&self, partitions: Vec<i32>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Resume {
            partitions,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_terminated())?
    }

    /// Partitions taken away from this consumer by a rebalance since the last call.
    pub async fn revoked_partitions(&self) -> Result<Vec<i32>> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Revoked { respond_to: tx }).await?;
        rx.await.map_err(|_| actor_terminated())
    }

    async fn send(&self, msg: ActorMessage) -> Result<()> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| actor_terminated())
    }
}

fn actor_terminated() -> Error {
    Error::Other("Kafka actor task terminated".to_string())
}
