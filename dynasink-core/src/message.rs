use bytes::Bytes;

pub type PartitionId = i32;
pub type Offset = i64;

/// One record read from the upstream log. Never mutated once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(partition: PartitionId, offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
        }
    }
}

impl From<dynasink_kafka::source::KafkaMessage> for RawRecord {
    fn from(message: dynasink_kafka::source::KafkaMessage) -> Self {
        Self {
            partition: message.partition,
            offset: message.offset,
            payload: message.value,
        }
    }
}
