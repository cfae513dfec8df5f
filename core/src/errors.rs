use thiserror::Error;

use crate::consumer::runner::RunnerState;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SourceError {
    /// The connection behind this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unrecoverable(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Message parsing failed: {reason}")]
    MessageParsing { reason: String },

    #[error("Consumer health check failed: {reason}")]
    HealthCheck { reason: String },

    #[error("Consumer stream ended")]
    StreamClosed,
}

/// Returned by the connection factory once its retry budget is spent.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Could not connect to the broker after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: SourceError,
    },
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Missing required fields in {topic} message: {fields:?}")]
    MissingFields {
        topic: String,
        fields: Vec<&'static str>,
    },

    #[error("Handler for {topic} failed: {error}")]
    Handler {
        topic: String,
        #[source]
        error: anyhow::Error,
    },

    #[error("Handler for {topic} panicked")]
    Panicked { topic: String },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to start Kafka consumer after {attempts} attempts")]
    ConsumerStart { attempts: u32 },

    #[error("Kafka consumer died (state: {state:?})")]
    ConsumerDead { state: RunnerState },

    #[error("Unknown job: {name}")]
    UnknownJob { name: String },

    #[error("Job already registered: {name}")]
    DuplicateJob { name: String },
}

impl SchedulerError {
    /// Conditions that take down the consumer subsystem as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::ConsumerStart { .. } | SchedulerError::ConsumerDead { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl From<serde_yaml::Error> for WorkerError {
    fn from(err: serde_yaml::Error) -> Self {
        WorkerError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl WorkerError {
    /// A restart of the whole background subsystem may recover from this.
    pub fn is_restartable(&self) -> bool {
        match self {
            WorkerError::Scheduler(e) => e.is_fatal(),
            _ => false,
        }
    }
}
