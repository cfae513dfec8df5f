pub mod kafka;

use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::errors::SourceError;

/// A record received from the broker, already decoded into a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Topic this record was read from; decides which handler gets it.
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Value,
}

impl Record {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            payload,
        }
    }
}

/// Records collected during one poll-process pass.
pub type Batch = Vec<Record>;

/// Creates connections to a broker.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Creates a client subscribed to `topics`. Liveness is checked separately
    /// with [`Connection::probe`].
    fn connect(
        &self,
        topics: &[String],
        config: &BrokerConfig,
    ) -> Result<Self::Connection, SourceError>;
}

/// An open, subscribed broker connection.
pub trait Connection: Send + 'static {
    /// Round-trips to the broker to prove the connection is usable.
    fn probe(&self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Waits up to `timeout` for records and returns at most `max_records`.
    /// An empty vector means the poll timed out.
    fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;

    /// Commits the progress of everything handed out so far.
    fn commit(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Returns how many received messages were dropped as undecodable since
    /// the last call, and resets the count.
    fn take_malformed(&mut self) -> usize {
        0
    }
}
