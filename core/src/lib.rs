pub mod backoff;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod telemetry;

pub use config::{BrokerConfig, WorkerConfig};
pub use errors::{Result, WorkerError};
