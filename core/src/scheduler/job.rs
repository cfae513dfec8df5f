use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{Every, JobConfig};
use crate::task::TaskFn;

/// A named piece of periodic work.
pub struct ScheduledJob {
    name: String,
    every: Every,
    enabled: Arc<AtomicBool>,
    handler: TaskFn,
}

impl ScheduledJob {
    pub fn new(name: &str, every: Every, handler: TaskFn) -> Self {
        Self {
            name: name.to_string(),
            every,
            enabled: Arc::new(AtomicBool::new(true)),
            handler,
        }
    }

    pub fn from_config(config: &JobConfig, handler: TaskFn) -> Self {
        Self::new(&config.name, config.every, handler).enabled(config.enabled)
    }

    pub fn enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.every.to_duration()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub(crate) fn handler(&self) -> TaskFn {
        self.handler.clone()
    }
}

/// A registered job plus its bookkeeping.
pub(crate) struct JobSlot {
    pub job: ScheduledJob,
    pub last_run: Instant,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
}

impl JobSlot {
    pub fn new(job: ScheduledJob) -> Self {
        Self {
            job,
            last_run: Instant::now(),
            last_run_at: None,
            runs: 0,
            failures: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_run) >= self.job.interval()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            name: self.job.name.clone(),
            enabled: self.job.is_enabled(),
            interval_secs: self.job.interval().as_secs(),
            last_run_at: self.last_run_at,
            runs: self.runs,
            failures: self.failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Times the handler was invoked; a disabled job does not count.
    pub runs: u64,
    pub failures: u64,
}
