use dynasink_kafka::source::KafkaSource;

use crate::checkpoint::AckFrontier;
use crate::error::Result;
use crate::message::{Offset, PartitionId, RawRecord};
use crate::source::RecordSource;

impl RecordSource for KafkaSource {
    async fn read(&mut self) -> Result<Vec<RawRecord>> {
        let messages = self.read_messages().await?;
        Ok(messages.into_iter().map(RawRecord::from).collect())
    }

    async fn ack(&mut self, frontier: &AckFrontier) -> Result<()> {
        let offsets = frontier
            .acknowledged()
            .iter()
            .map(|(partition, offset)| (*partition, *offset))
            .collect();
        self.ack_messages(offsets).await?;
        Ok(())
    }

    async fn rewind(&mut self, partition: PartitionId, offset: Offset) -> Result<()> {
        KafkaSource::rewind(self, partition, offset).await?;
        Ok(())
    }

    async fn pause(&mut self, partitions: &[PartitionId]) -> Result<()> {
        KafkaSource::pause(self, partitions.to_vec()).await?;
        Ok(())
    }

    async fn resume(&mut self, partitions: &[PartitionId]) -> Result<()> {
        KafkaSource::resume(self, partitions.to_vec()).await?;
        Ok(())
    }

    async fn revoked(&mut self) -> Result<Vec<PartitionId>> {
        Ok(self.revoked_partitions().await?)
    }
}
