use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ConsumerOptions;
use crate::errors::SourceError;
use crate::source::{Batch, Connection};

/// Accumulates polled records into batches bounded by count and collection time.
///
/// The pending batch lives on the poller, so a poll error returned from
/// [`BatchPoller::next_batch`] does not drop records that were already
/// collected; the next call continues the same batch and keeps its timer.
pub struct BatchPoller {
    batch_size: usize,
    batch_timeout: Duration,
    poll_timeout: Duration,
    idle_sleep: Duration,
    pending: Batch,
    started_at: Option<Instant>,
}

impl BatchPoller {
    pub fn new(options: &ConsumerOptions) -> Self {
        Self {
            batch_size: options.batch_size.max(1),
            batch_timeout: options.batch_timeout(),
            poll_timeout: options.poll_timeout(),
            idle_sleep: options.idle_sleep(),
            pending: Vec::new(),
            started_at: None,
        }
    }

    /// Polls until a non-empty batch is ready. The batch closes at
    /// `batch_size` records or `batch_timeout` after its first record,
    /// whichever comes first.
    pub async fn next_batch<C: Connection>(&mut self, conn: &mut C) -> Result<Batch, SourceError> {
        loop {
            if self.is_full() || self.is_expired() {
                return Ok(self.flush());
            }

            let room = self.batch_size - self.pending.len();
            let records = conn.poll(self.wait_limit(), room).await?;

            if records.is_empty() {
                if self.pending.is_empty() {
                    tokio::time::sleep(self.idle_sleep).await;
                }
                continue;
            }

            if self.started_at.is_none() {
                self.started_at = Some(Instant::now());
            }
            debug!("Polled {} records", records.len());
            self.pending.extend(records);
            // connections may ignore the size hint
            if self.pending.len() > self.batch_size {
                let overflow = self.pending.split_off(self.batch_size);
                let batch = std::mem::replace(&mut self.pending, overflow);
                self.started_at = Some(Instant::now());
                return Ok(batch);
            }
        }
    }

    /// Emits whatever has been collected so far, possibly nothing.
    pub fn flush(&mut self) -> Batch {
        self.started_at = None;
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    /// Never waits past the end of the current batch window.
    fn wait_limit(&self) -> Duration {
        match self.started_at {
            Some(started) => self
                .poll_timeout
                .min(self.batch_timeout.saturating_sub(started.elapsed())),
            None => self.poll_timeout,
        }
    }

    fn is_expired(&self) -> bool {
        self.started_at
            .is_some_and(|started| started.elapsed() >= self.batch_timeout)
    }
}
