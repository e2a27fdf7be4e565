//! The upstream log seam: batches of records in, acknowledgments, rewinds and flow control out.
use crate::checkpoint::AckFrontier;
use crate::error::Result;
use crate::message::{Offset, PartitionId, RawRecord};

/// Kafka implementation of [`RecordSource`].
pub(crate) mod kafka;

#[trait_variant::make(RecordSource: Send)]
#[allow(dead_code)]
pub trait LocalRecordSource {
    /// Next batch. May be empty when nothing arrived within the read timeout.
    async fn read(&mut self) -> Result<Vec<RawRecord>>;

    /// Marks everything up to and including the acknowledged offsets as consumed.
    async fn ack(&mut self, frontier: &AckFrontier) -> Result<()>;

    /// Delivers `partition` again starting at `offset`.
    async fn rewind(&mut self, partition: PartitionId, offset: Offset) -> Result<()>;

    /// Stops delivering `partitions` until they are resumed.
    async fn pause(&mut self, partitions: &[PartitionId]) -> Result<()>;

    async fn resume(&mut self, partitions: &[PartitionId]) -> Result<()>;

    /// Partitions taken away from this source since the last call. Records of a revoked
    /// partition read before the call may still be in the last batch.
    async fn revoked(&mut self) -> Result<Vec<PartitionId>>;
}
