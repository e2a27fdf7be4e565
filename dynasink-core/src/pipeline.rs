//! Drives one batch through mapping, committing and flushing, and computes what may be
//! acknowledged upstream.
//!
//! ```text
//! RECEIVED -> MAPPED -> COMMITTING -> FLUSHED -> ACK_COMPUTED
//! ```
//!
//! Rejected records are logged and count as resolved right away. A failed write holds the
//! frontier of its partition just before it so the record is delivered again.
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::{AckFrontier, CheckpointState, Resolution};
use crate::committer::Committer;
use crate::error::Result;
use crate::mapper::{self, MappingOutcome};
use crate::message::{PartitionId, RawRecord};
use crate::schema::TableSchema;

pub struct SinkPipeline {
    schema: Arc<TableSchema>,
    committer: Committer,
    checkpoint: CheckpointState,
}

impl SinkPipeline {
    pub fn new(schema: Arc<TableSchema>, committer: Committer) -> Self {
        Self {
            schema,
            committer,
            checkpoint: CheckpointState::new(),
        }
    }

    /// Processes one batch. Only a flush that cannot complete is an error, and it is fatal.
    pub async fn process(&mut self, batch: Vec<RawRecord>) -> Result<AckFrontier> {
        let received = batch.len();
        let mut resolutions = Vec::with_capacity(received);

        // mapped once per record, the item is moved into the committer
        let mut accepted = Vec::with_capacity(received);
        for record in &batch {
            match mapper::map(record, &self.schema) {
                MappingOutcome::Accepted(item) => {
                    accepted.push((record.partition, record.offset, item))
                }
                MappingOutcome::Rejected { reason, payload } => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        %reason,
                        payload = %String::from_utf8_lossy(&payload),
                        "Skipping record that does not match the table schema"
                    );
                    resolutions.push((record.partition, record.offset, Resolution::Resolved));
                }
            }
        }
        let rejected = resolutions.len();

        let mut pending = Vec::with_capacity(accepted.len());
        for (partition, offset, item) in accepted {
            pending.push(self.committer.commit(partition, offset, item).await?);
        }

        self.committer.flush().await?;

        let mut failed = 0;
        for write in pending {
            let result = write.result().await;
            let resolution = if result.is_committed() {
                Resolution::Resolved
            } else {
                failed += 1;
                Resolution::Unresolved
            };
            resolutions.push((result.partition(), result.offset(), resolution));
        }

        let frontier = self.checkpoint.advance(resolutions);
        if rejected > 0 || failed > 0 {
            info!(received, rejected, failed, acknowledged = ?frontier.acknowledged(), "Processed batch");
        } else {
            debug!(received, acknowledged = ?frontier.acknowledged(), "Processed batch");
        }
        Ok(frontier)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn forget(&mut self, partition: PartitionId) {
        self.checkpoint.forget(partition);
    }

    /// Waits for in-flight writes and releases the store client.
    pub async fn shutdown(self) -> Result<()> {
        self.committer.shutdown().await
    }
}
