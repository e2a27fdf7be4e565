use std::collections::HashMap;

use crate::error::{Error, Result};

/// Version reported by the connector and every task.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DYNAMODB_TABLE: &str = "dynamodb.table";
pub const DYNAMODB_REGION: &str = "dynamodb.region";

/// Validated store settings shared by every task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub table: String,
    pub region: String,
}

impl TaskConfig {
    pub fn from_props(props: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            table: required(props, DYNAMODB_TABLE)?,
            region: required(props, DYNAMODB_REGION)?,
        })
    }

    fn to_props(&self) -> HashMap<String, String> {
        HashMap::from([
            (DYNAMODB_TABLE.to_string(), self.table.clone()),
            (DYNAMODB_REGION.to_string(), self.region.clone()),
        ])
    }
}

/// Entry point that validates the sink configuration and fans it out to tasks.
#[derive(Debug, Clone)]
pub struct Connector {
    config: TaskConfig,
}

impl Connector {
    /// Fails with a configuration error when the table or region is missing or empty.
    pub fn start(props: &HashMap<String, String>) -> Result<Self> {
        let config = TaskConfig::from_props(props)?;
        tracing::info!(table = %config.table, region = %config.region, version = VERSION, "Connector started");
        Ok(Self { config })
    }

    /// One property map per task, all identical.
    pub fn task_configs(&self, max_tasks: usize) -> Vec<HashMap<String, String>> {
        (0..max_tasks).map(|_| self.config.to_props()).collect()
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }
}

fn required(props: &HashMap<String, String>, key: &str) -> Result<String> {
    match props.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(Error::Config(format!("{key} not configured"))),
    }
}
