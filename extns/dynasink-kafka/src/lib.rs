//! Kafka consumer used as the upstream log of the sink.
//!
//! The consumer runs as an actor owning the rdkafka `StreamConsumer`; the cloneable
//! [`source::KafkaSource`] handle talks to it over a channel. Offsets are never auto-committed,
//! only what the caller acknowledges is committed.
use std::collections::HashMap;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};

pub mod source;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// Bootstrap servers.
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    /// Extra librdkafka properties (security settings, fetch tuning, ...). They are applied
    /// first, so the settings the sink depends on cannot be overridden.
    pub properties: HashMap<String, String>,
}

impl KafkaSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::InvalidConfig("at least one broker is required".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(Error::InvalidConfig("topic must not be empty".into()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(Error::InvalidConfig("consumer group must not be empty".into()));
        }
        Ok(())
    }

    /// librdkafka client settings for this consumer.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &self.properties {
            client_config.set(key, value);
        }
        client_config
            .set("group.id", &self.consumer_group)
            .set("bootstrap.servers", self.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);
        client_config
    }
}
