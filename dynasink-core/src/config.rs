//! Settings loaded from `DYNASINK_*` environment variables.
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use dynasink_kafka::KafkaSourceConfig;

use crate::connector::{DYNAMODB_REGION, DYNAMODB_TABLE};
use crate::error::{Error, Result};

const ENV_TABLE: &str = "DYNASINK_TABLE";
const ENV_REGION: &str = "DYNASINK_REGION";
const ENV_ENDPOINT_URL: &str = "DYNASINK_ENDPOINT_URL";
const ENV_KAFKA_BROKERS: &str = "DYNASINK_KAFKA_BROKERS";
const ENV_KAFKA_TOPIC: &str = "DYNASINK_KAFKA_TOPIC";
const ENV_KAFKA_GROUP: &str = "DYNASINK_KAFKA_GROUP";
const ENV_KAFKA_PROPERTIES: &str = "DYNASINK_KAFKA_PROPERTIES";
const ENV_MAX_TASKS: &str = "DYNASINK_MAX_TASKS";
const ENV_BATCH_SIZE: &str = "DYNASINK_BATCH_SIZE";
const ENV_READ_TIMEOUT_MS: &str = "DYNASINK_READ_TIMEOUT_MS";
const ENV_WRITE_TIMEOUT_MS: &str = "DYNASINK_WRITE_TIMEOUT_MS";
const ENV_FLUSH_TIMEOUT_MS: &str = "DYNASINK_FLUSH_TIMEOUT_MS";
const ENV_MAX_IN_FLIGHT: &str = "DYNASINK_MAX_IN_FLIGHT";
const ENV_RETRY_MAX_ATTEMPTS: &str = "DYNASINK_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_INITIAL_INTERVAL_MS: &str = "DYNASINK_RETRY_INITIAL_INTERVAL_MS";
const ENV_RETRY_MAX_INTERVAL_MS: &str = "DYNASINK_RETRY_MAX_INTERVAL_MS";
const ENV_RETRY_FACTOR: &str = "DYNASINK_RETRY_FACTOR";
const ENV_RETRY_JITTER: &str = "DYNASINK_RETRY_JITTER";

const DEFAULT_KAFKA_GROUP: &str = "dynasink";
const DEFAULT_MAX_TASKS: usize = 1;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 60000;
const DEFAULT_MAX_IN_FLIGHT: usize = 16;
const DEFAULT_RETRY_MAX_ATTEMPTS: u16 = 3;
const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 100;
const DEFAULT_RETRY_MAX_INTERVAL_MS: u64 = 2000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Local retry of transient write failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: u16,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MS),
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitterConfig {
    /// Bound on every single store call.
    pub write_timeout: Duration,
    /// Bound on the whole flush barrier. Exceeding it is fatal for the task.
    pub flush_timeout: Duration,
    pub max_in_flight: usize,
    pub retry: RetryConfig,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub table: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub kafka: KafkaSourceConfig,
    pub max_tasks: usize,
    pub batch_size: usize,
    pub read_timeout: Duration,
    pub committer: CommitterConfig,
}

impl Settings {
    /// Loads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::load(std::env::vars())
    }

    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _)| key.starts_with("DYNASINK_"))
            .collect();

        let brokers = required(&env_vars, ENV_KAFKA_BROKERS)?
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(String::from)
            .collect();
        let properties = match env_vars.get(ENV_KAFKA_PROPERTIES) {
            Some(raw) => parse_properties(raw)?,
            None => HashMap::new(),
        };
        let kafka = KafkaSourceConfig {
            brokers,
            topic: required(&env_vars, ENV_KAFKA_TOPIC)?,
            consumer_group: env_vars
                .get(ENV_KAFKA_GROUP)
                .cloned()
                .unwrap_or_else(|| DEFAULT_KAFKA_GROUP.to_string()),
            properties,
        };
        kafka.validate()?;

        let retry = RetryConfig {
            max_attempts: parse_or(&env_vars, ENV_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_ATTEMPTS)?,
            initial_interval: millis_or(
                &env_vars,
                ENV_RETRY_INITIAL_INTERVAL_MS,
                DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            )?,
            max_interval: millis_or(
                &env_vars,
                ENV_RETRY_MAX_INTERVAL_MS,
                DEFAULT_RETRY_MAX_INTERVAL_MS,
            )?,
            factor: parse_or(&env_vars, ENV_RETRY_FACTOR, DEFAULT_RETRY_FACTOR)?,
            jitter: parse_or(&env_vars, ENV_RETRY_JITTER, DEFAULT_RETRY_JITTER)?,
        };

        let settings = Settings {
            table: required(&env_vars, ENV_TABLE)?,
            region: required(&env_vars, ENV_REGION)?,
            endpoint_url: env_vars.get(ENV_ENDPOINT_URL).cloned(),
            kafka,
            max_tasks: parse_or(&env_vars, ENV_MAX_TASKS, DEFAULT_MAX_TASKS)?,
            batch_size: parse_or(&env_vars, ENV_BATCH_SIZE, DEFAULT_BATCH_SIZE)?,
            read_timeout: millis_or(&env_vars, ENV_READ_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS)?,
            committer: CommitterConfig {
                write_timeout: millis_or(
                    &env_vars,
                    ENV_WRITE_TIMEOUT_MS,
                    DEFAULT_WRITE_TIMEOUT_MS,
                )?,
                flush_timeout: millis_or(
                    &env_vars,
                    ENV_FLUSH_TIMEOUT_MS,
                    DEFAULT_FLUSH_TIMEOUT_MS,
                )?,
                max_in_flight: parse_or(&env_vars, ENV_MAX_IN_FLIGHT, DEFAULT_MAX_IN_FLIGHT)?,
                retry,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            (ENV_MAX_TASKS, self.max_tasks),
            (ENV_BATCH_SIZE, self.batch_size),
            (ENV_MAX_IN_FLIGHT, self.committer.max_in_flight),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            (ENV_READ_TIMEOUT_MS, self.read_timeout),
            (ENV_WRITE_TIMEOUT_MS, self.committer.write_timeout),
            (ENV_FLUSH_TIMEOUT_MS, self.committer.flush_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        let retry = &self.committer.retry;
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config(format!(
                "{ENV_RETRY_JITTER} must be within [0, 1], got {}",
                retry.jitter
            )));
        }
        if !retry.factor.is_finite() || retry.factor < 1.0 {
            return Err(Error::Config(format!(
                "{ENV_RETRY_FACTOR} must be at least 1, got {}",
                retry.factor
            )));
        }
        if retry.initial_interval > retry.max_interval {
            return Err(Error::Config(format!(
                "{ENV_RETRY_INITIAL_INTERVAL_MS} must not exceed {ENV_RETRY_MAX_INTERVAL_MS}"
            )));
        }
        Ok(())
    }

    /// Connector properties carrying the store settings.
    pub fn connector_props(&self) -> HashMap<String, String> {
        HashMap::from([
            (DYNAMODB_TABLE.to_string(), self.table.clone()),
            (DYNAMODB_REGION.to_string(), self.region.clone()),
        ])
    }
}

fn required(env_vars: &HashMap<String, String>, name: &str) -> Result<String> {
    match env_vars.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(Error::Config(format!("{name} is not set"))),
    }
}

fn parse_or<T>(env_vars: &HashMap<String, String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Failed to parse {name}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn millis_or(env_vars: &HashMap<String, String>, name: &str, default: u64) -> Result<Duration> {
    parse_or(env_vars, name, default).map(Duration::from_millis)
}

/// Parses `key=value` pairs separated by commas.
fn parse_properties(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "{ENV_KAFKA_PROPERTIES} entry {pair:?} is not of the form key=value"
            ))),
        })
        .collect()
}
