//! Per-partition acknowledgment bookkeeping.
//!
//! A partition's checkpoint is the highest offset such that every record up to it, as delivered,
//! was either rejected by the mapper or committed to the store. The first record that did not
//! resolve stalls the partition: nothing past it is acknowledged until it is redelivered and
//! resolves. A partition the task no longer owns is forgotten, its next owner starts from the
//! upstream committed offset.
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::message::{Offset, PartitionId};

/// Whether a record is done with, as far as acknowledgment goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Rejected by the mapper or committed to the store.
    Resolved,
    /// The write failed, the record must be delivered again.
    Unresolved,
}

/// What may be acknowledged upstream after a batch, and where redelivery must restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckFrontier {
    acknowledged: BTreeMap<PartitionId, Offset>,
    redeliver_from: BTreeMap<PartitionId, Offset>,
}

impl AckFrontier {
    /// Highest acknowledgeable offset per partition seen in the batch.
    pub fn acknowledged(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.acknowledged
    }

    pub fn get(&self, partition: PartitionId) -> Option<Offset> {
        self.acknowledged.get(&partition).copied()
    }

    /// Partitions of the batch holding an unresolved record, with the offset to redeliver from.
    pub fn redeliver_from(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.redeliver_from
    }

    pub fn is_stalled(&self) -> bool {
        !self.redeliver_from.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PartitionCheckpoint {
    committed: Option<Offset>,
    stalled_at: Option<Offset>,
}

/// Checkpoints of one task. Starts empty and is not persisted; offsets only move forward.
#[derive(Debug, Default)]
pub struct CheckpointState {
    partitions: HashMap<PartitionId, PartitionCheckpoint>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self, partition: PartitionId) -> Option<Offset> {
        self.partitions.get(&partition).and_then(|p| p.committed)
    }

    /// Folds the outcomes of one flushed batch into the checkpoints.
    pub fn advance(
        &mut self,
        outcomes: impl IntoIterator<Item = (PartitionId, Offset, Resolution)>,
    ) -> AckFrontier {
        let mut by_partition: BTreeMap<PartitionId, BTreeMap<Offset, Resolution>> = BTreeMap::new();
        for (partition, offset, resolution) in outcomes {
            by_partition
                .entry(partition)
                .or_default()
                .entry(offset)
                .and_modify(|existing| {
                    if resolution == Resolution::Unresolved {
                        *existing = Resolution::Unresolved;
                    }
                })
                .or_insert(resolution);
        }

        let mut frontier = AckFrontier::default();
        for (partition, records) in by_partition {
            let checkpoint = self.partitions.entry(partition).or_default();
            for (offset, resolution) in records {
                if checkpoint.committed.is_some_and(|committed| offset <= committed) {
                    // redelivered, already acknowledged
                    continue;
                }
                if checkpoint.stalled_at.is_some_and(|stalled| offset > stalled) {
                    break;
                }
                if resolution == Resolution::Unresolved {
                    checkpoint.stalled_at = Some(offset);
                    break;
                }
                checkpoint.committed = Some(offset);
                if checkpoint.stalled_at == Some(offset) {
                    checkpoint.stalled_at = None;
                }
            }

            if let Some(committed) = checkpoint.committed {
                frontier.acknowledged.insert(partition, committed);
            }
            if let Some(stalled) = checkpoint.stalled_at {
                frontier.redeliver_from.insert(partition, stalled);
            }
            debug!(
                partition,
                committed = ?checkpoint.committed,
                stalled_at = ?checkpoint.stalled_at,
                "Checkpoint advanced"
            );
        }
        frontier
    }

    /// Drops everything known about `partition`, typically after it was revoked.
    pub fn forget(&mut self, partition: PartitionId) {
        if let Some(checkpoint) = self.partitions.remove(&partition) {
            debug!(
                partition,
                committed = ?checkpoint.committed,
                stalled_at = ?checkpoint.stalled_at,
                "Checkpoint forgotten"
            );
        }
    }
}
