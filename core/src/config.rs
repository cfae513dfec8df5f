use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{ConfigError, Result};

/// Topics the background consumer subscribes to unless configured otherwise.
pub const DEFAULT_TOPICS: [&str; 2] = ["notifications", "generic_topic"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerOptions,
    #[serde(default)]
    pub scheduler: SchedulerOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub bootstrap_servers: Vec<String>,
    pub group_id: String,
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
    #[serde(default = "default_true")]
    pub enable_auto_commit: bool,
    /// Broker protocol version used when the broker cannot be asked for it.
    pub protocol_version: Option<String>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u32,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub topics: Vec<String>,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub error_sleep_ms: u64,
    pub connect_max_retries: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            batch_size: 25,
            batch_timeout_ms: 5000,
            poll_timeout_ms: 1000,
            idle_sleep_ms: 1000,
            error_sleep_ms: 1000,
            connect_max_retries: 5,
        }
    }
}

impl ConsumerOptions {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn error_sleep(&self) -> Duration {
        Duration::from_millis(self.error_sleep_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub tick_interval_ms: u64,
    pub consumer_enabled: bool,
    pub consumer_start_retries: u32,
    /// Pause before the host rebuilds a subsystem that died.
    pub restart_delay_ms: u64,
    pub jobs: Vec<JobConfig>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            consumer_enabled: true,
            consumer_start_retries: 3,
            restart_delay_ms: 5000,
            jobs: vec![
                JobConfig::new("process_notifications", Every::seconds(30)),
                JobConfig::new("task1", Every::minutes(5)),
                JobConfig::new("task2", Every::minutes(15)),
            ],
        }
    }
}

impl SchedulerOptions {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    pub name: String,
    pub every: Every,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl JobConfig {
    pub fn new(name: &str, every: Every) -> Self {
        Self {
            name: name.to_string(),
            every,
            enabled: true,
        }
    }
}

/// A job interval written the way humans schedule things: `every 5 minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Every {
    pub count: u64,
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl Every {
    pub fn seconds(count: u64) -> Self {
        Self {
            count,
            unit: TimeUnit::Seconds,
        }
    }

    pub fn minutes(count: u64) -> Self {
        Self {
            count,
            unit: TimeUnit::Minutes,
        }
    }

    pub fn hours(count: u64) -> Self {
        Self {
            count,
            unit: TimeUnit::Hours,
        }
    }

    pub fn to_duration(&self) -> Duration {
        let secs = match self.unit {
            TimeUnit::Seconds => self.count,
            TimeUnit::Minutes => self.count.saturating_mul(60),
            TimeUnit::Hours => self.count.saturating_mul(3600),
        };
        Duration::from_secs(secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_session_timeout_ms() -> u32 {
    6000
}

fn default_request_timeout_ms() -> u32 {
    10000
}

impl BrokerConfig {
    pub fn new(bootstrap_servers: Vec<String>, group_id: &str) -> Self {
        Self {
            bootstrap_servers,
            group_id: group_id.to_string(),
            auto_offset_reset: OffsetReset::default(),
            enable_auto_commit: true,
            protocol_version: None,
            session_timeout_ms: default_session_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }

    pub fn bootstrap_servers(&self) -> String {
        self.bootstrap_servers.join(",")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms as u64)
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<WorkerConfig> {
    let config = match config_path {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Reads a YAML document from `WORKER_CONFIG`, falling back to a plain
    /// `KAFKA_HOST`/`KAFKA_PORT` pair with default options.
    pub fn from_env() -> Result<Self> {
        if let Ok(config_str) = std::env::var("WORKER_CONFIG") {
            let config: WorkerConfig = serde_yaml::from_str(&config_str)?;
            return Ok(config);
        }

        let host = std::env::var("KAFKA_HOST").map_err(|_| ConfigError::MissingField {
            field: "WORKER_CONFIG or KAFKA_HOST".to_string(),
        })?;
        let port = std::env::var("KAFKA_PORT").unwrap_or_else(|_| "9092".to_string());
        let group_id =
            std::env::var("KAFKA_GROUP_ID").unwrap_or_else(|_| "background-worker".to_string());

        Ok(Self {
            broker: BrokerConfig::new(vec![format!("{host}:{port}")], &group_id),
            consumer: ConsumerOptions::default(),
            scheduler: SchedulerOptions::default(),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::ValidationFailed { reason });

        if self.broker.bootstrap_servers.iter().all(|s| s.trim().is_empty()) {
            return invalid("Kafka bootstrap servers cannot be empty".to_string());
        }
        if self.broker.group_id.is_empty() {
            return invalid("Kafka consumer group cannot be empty".to_string());
        }
        if self.consumer.topics.is_empty() {
            return invalid("At least one topic must be configured".to_string());
        }
        if self.consumer.batch_size == 0 {
            return invalid("Batch size must be greater than zero".to_string());
        }
        if self.scheduler.tick_interval_ms == 0 {
            return invalid("Scheduler tick interval must be greater than zero".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for job in &self.scheduler.jobs {
            if job.every.count == 0 {
                return invalid(format!("Job {} must have a non-zero interval", job.name));
            }
            if !names.insert(job.name.as_str()) {
                return invalid(format!("Job {} is configured twice", job.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WorkerError;
    use std::io::Write;

    const SAMPLE: &str = r#"
broker:
  bootstrap_servers: ["kafka-1:9092", "kafka-2:9092"]
  group_id: notifications-worker
  auto_offset_reset: latest
  enable_auto_commit: false
  protocol_version: "2.8.1"
consumer:
  batch_size: 10
scheduler:
  tick_interval_ms: 1000
  jobs:
    - name: process_notifications
      every: { count: 30, unit: seconds }
    - name: cleanup
      every: { count: 2, unit: hours }
      enabled: false
"#;

    #[test]
    fn test_parse_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.broker.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.broker.auto_offset_reset, OffsetReset::Latest);
        assert!(!config.broker.enable_auto_commit);
        assert_eq!(config.broker.session_timeout_ms, 6000);
        assert_eq!(config.broker.request_timeout(), Duration::from_secs(10));

        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.consumer.batch_timeout(), Duration::from_secs(5));
        assert_eq!(config.consumer.topics, vec!["notifications", "generic_topic"]);

        assert_eq!(config.scheduler.jobs.len(), 2);
        assert!(!config.scheduler.jobs[1].enabled);
        assert_eq!(
            config.scheduler.jobs[1].every.to_duration(),
            Duration::from_secs(7200)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_default_jobs() {
        let options = SchedulerOptions::default();
        let intervals: Vec<_> = options
            .jobs
            .iter()
            .map(|j| (j.name.as_str(), j.every.to_duration().as_secs()))
            .collect();
        assert_eq!(
            intervals,
            vec![("process_notifications", 30), ("task1", 300), ("task2", 900)]
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_jobs() {
        let mut config = WorkerConfig {
            broker: BrokerConfig::new(vec!["localhost:9092".to_string()], "group"),
            consumer: ConsumerOptions::default(),
            scheduler: SchedulerOptions::default(),
        };
        config.validate().unwrap();

        config
            .scheduler
            .jobs
            .push(JobConfig::new("task1", Every::seconds(1)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_load_errors_are_typed() {
        let missing = WorkerConfig::from_file("/nonexistent/worker.yaml").unwrap_err();
        assert!(matches!(missing, WorkerError::Io(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"broker: [").unwrap();
        let malformed = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(malformed, WorkerError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_load_config_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"broker:\n  bootstrap_servers: []\n  group_id: worker\n").unwrap();

        let err = load_config(file.path().to_str()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Config(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_huge_intervals_saturate() {
        assert_eq!(Every::hours(u64::MAX).to_duration(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_validate_rejects_empty_servers() {
        let config = WorkerConfig {
            broker: BrokerConfig::new(vec![" ".to_string()], "group"),
            consumer: ConsumerOptions::default(),
            scheduler: SchedulerOptions::default(),
        };
        assert!(config.validate().is_err());
    }
}
