use std::collections::HashMap;

use tracing::info;

use crate::checkpoint::AckFrontier;
use crate::committer::Committer;
use crate::config::CommitterConfig;
use crate::connector::{TaskConfig, VERSION};
use crate::error::Result;
use crate::message::{PartitionId, RawRecord};
use crate::pipeline::SinkPipeline;
use crate::schema::{SchemaRegistry, TableSchema};
use crate::store::TableStore;

/// One sink task: its own schema cache, committer and store client.
pub struct SinkTask {
    table: String,
    pipeline: SinkPipeline,
}

impl SinkTask {
    /// Loads the table schema and starts the committer. Nothing is processed if either fails.
    pub async fn start<S>(
        props: &HashMap<String, String>,
        store: S,
        config: CommitterConfig,
    ) -> Result<Self>
    where
        S: TableStore + Clone + Sync + 'static,
    {
        let task_config = TaskConfig::from_props(props)?;
        let schema = SchemaRegistry::load(&store, &task_config.table).await?;
        let committer = Committer::start(store, &schema, config);
        info!(table = %task_config.table, region = %task_config.region, "Store client has been initialized");

        Ok(Self {
            table: task_config.table,
            pipeline: SinkPipeline::new(schema, committer),
        })
    }

    /// Writes a batch and returns what may be acknowledged.
    pub async fn put(&mut self, batch: Vec<RawRecord>) -> Result<AckFrontier> {
        self.pipeline.process(batch).await
    }

    /// Drops the checkpoint of a partition this task no longer owns.
    pub fn forget(&mut self, partition: PartitionId) {
        self.pipeline.forget(partition);
    }

    /// Waits for in-flight writes, then releases the store client.
    pub async fn stop(self) -> Result<()> {
        info!(table = %self.table, "Stopping sink task");
        self.pipeline.shutdown().await
    }

    pub fn schema(&self) -> &TableSchema {
        self.pipeline.schema()
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }
}
