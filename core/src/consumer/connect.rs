use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::BrokerConfig;
use crate::errors::{ConnectError, SourceError};
use crate::source::{Connection, Connector};

/// Opens probed broker connections, retrying with capped exponential backoff.
pub struct ConnectionFactory<C: Connector> {
    connector: Arc<C>,
    max_retries: u32,
    backoff: Backoff,
}

impl<C: Connector> ConnectionFactory<C> {
    pub fn new(connector: Arc<C>, max_retries: u32) -> Self {
        Self {
            connector,
            max_retries: max_retries.max(1),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Makes up to `max_retries` attempts. Giving up is reported as
    /// [`ConnectError::Exhausted`]; whether that is fatal is the caller's call.
    pub async fn open(
        &self,
        topics: &[String],
        config: &BrokerConfig,
    ) -> Result<C::Connection, ConnectError> {
        let mut attempt = 0;
        loop {
            debug!(
                "Attempting to create Kafka consumer for topics: {:?} (attempt {}/{})",
                topics,
                attempt + 1,
                self.max_retries
            );

            let err = match self.try_open(topics, config).await {
                Ok(connection) => {
                    info!("Successfully created Kafka consumer");
                    return Ok(connection);
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= self.max_retries {
                error!(
                    "Failed to create Kafka consumer after {} attempts: {}",
                    attempt, err
                );
                return Err(ConnectError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let wait = self.backoff.delay(attempt);
            warn!(
                "Failed to create Kafka consumer (attempt {}/{}): {}. Retrying in {:?}...",
                attempt, self.max_retries, err, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn try_open(
        &self,
        topics: &[String],
        config: &BrokerConfig,
    ) -> Result<C::Connection, SourceError> {
        let connection = self.connector.connect(topics, config)?;
        connection.probe().await?;
        Ok(connection)
    }
}
