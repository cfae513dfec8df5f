pub mod job;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::SchedulerOptions;
use crate::consumer::runner::{ConsumerRunner, RunnerHandle, RunnerState};
use crate::errors::SchedulerError;
use crate::source::Connector;
use crate::task::{TaskFailure, guarded};

pub use job::{JobStatus, ScheduledJob};
use job::JobSlot;

/// Name under which the Kafka consumer can be toggled like any other job.
pub const CONSUMER_JOB: &str = "kafka_consumer";

/// Cheap, cloneable switchboard for a running [`Scheduler`].
///
/// Toggles only flip flags; the scheduler acts on them at its next tick.
#[derive(Clone, Default)]
pub struct SchedulerControls {
    inner: Arc<ControlState>,
}

#[derive(Default)]
struct ControlState {
    jobs: RwLock<HashMap<String, Arc<AtomicBool>>>,
    consumer_enabled: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
}

impl SchedulerControls {
    pub fn toggle(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        if name == CONSUMER_JOB {
            self.toggle_consumer(enabled);
            return Ok(());
        }

        let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
        let flag = jobs.get(name).ok_or_else(|| SchedulerError::UnknownJob {
            name: name.to_string(),
        })?;
        flag.store(enabled, Ordering::SeqCst);
        info!(
            "{} processing {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn toggle_consumer(&self, enabled: bool) {
        self.inner.consumer_enabled.store(enabled, Ordering::SeqCst);
        info!(
            "Kafka consumer {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        if name == CONSUMER_JOB {
            return Some(self.consumer_enabled());
        }
        let jobs = self.inner.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(name).map(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn consumer_enabled(&self) -> bool {
        self.inner.consumer_enabled.load(Ordering::SeqCst)
    }

    /// Makes [`Scheduler::run`] stop the consumer and return `Ok(())`.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    fn insert(&self, name: &str, flag: Arc<AtomicBool>) {
        let mut jobs = self.inner.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(name.to_string(), flag);
    }
}

/// Runs periodic jobs and supervises the Kafka consumer.
pub struct Scheduler<C: Connector> {
    options: SchedulerOptions,
    runner: ConsumerRunner<C>,
    backoff: Backoff,
    jobs: Vec<JobSlot>,
    controls: SchedulerControls,
    consumer: Option<RunnerHandle>,
}

impl<C: Connector> Scheduler<C> {
    pub fn new(options: SchedulerOptions, runner: ConsumerRunner<C>) -> Self {
        let controls = SchedulerControls::default();
        controls
            .inner
            .consumer_enabled
            .store(options.consumer_enabled, Ordering::SeqCst);

        Self {
            options,
            runner,
            backoff: Backoff::default(),
            jobs: Vec::new(),
            controls,
            consumer: None,
        }
    }

    /// Backoff between consumer start attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn controls(&self) -> SchedulerControls {
        self.controls.clone()
    }

    pub fn register(&mut self, job: ScheduledJob) -> Result<(), SchedulerError> {
        if job.name() == CONSUMER_JOB || self.jobs.iter().any(|s| s.job.name() == job.name()) {
            return Err(SchedulerError::DuplicateJob {
                name: job.name().to_string(),
            });
        }
        debug!("Registered job {} every {:?}", job.name(), job.interval());
        self.controls.insert(job.name(), job.flag());
        self.jobs.push(JobSlot::new(job));
        Ok(())
    }

    pub fn job_statuses(&self) -> Vec<JobStatus> {
        self.jobs.iter().map(JobSlot::status).collect()
    }

    pub fn consumer_state(&self) -> Option<RunnerState> {
        self.consumer.as_ref().map(RunnerHandle::state)
    }

    pub fn consumer(&self) -> Option<&RunnerHandle> {
        self.consumer.as_ref()
    }

    /// Runs until [`SchedulerControls::shutdown`] is called or the consumer
    /// subsystem dies. Only the latter returns an error, and it is always
    /// one for which [`SchedulerError::is_fatal`] holds.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        info!("Starting service scheduler");

        let now = Instant::now();
        for slot in &mut self.jobs {
            slot.last_run = now;
        }

        if let Err(e) = self.startup().await {
            error!("Critical error in scheduler: {}", e);
            return Err(e);
        }

        let controls = self.controls.clone();
        let mut ticker = tokio::time::interval(self.options.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = controls.inner.wake.notified() => {}
            }

            if controls.shutdown_requested() {
                self.shutdown().await;
                info!("Service scheduler stopped");
                return Ok(());
            }

            if let Err(e) = self.tick().await {
                error!("Critical error in scheduler: {}", e);
                return Err(e);
            }
        }
    }

    async fn startup(&mut self) -> Result<(), SchedulerError> {
        if self.controls.consumer_enabled() {
            debug!("Attempting to start Kafka consumer...");
        }
        self.reconcile_consumer().await?;
        info!("All tasks scheduled successfully");
        self.check_consumer_health()
    }

    /// One pass of the dispatch loop.
    pub async fn tick(&mut self) -> Result<(), SchedulerError> {
        self.reconcile_consumer().await?;
        self.run_due_jobs().await;
        self.check_consumer_health()
    }

    /// A consumer that is enabled but not alive means records are silently
    /// piling up; that is reported as [`SchedulerError::ConsumerDead`].
    pub fn check_consumer_health(&self) -> Result<(), SchedulerError> {
        if !self.controls.consumer_enabled() {
            return Ok(());
        }
        match &self.consumer {
            Some(handle) if handle.is_alive() => Ok(()),
            Some(handle) => Err(SchedulerError::ConsumerDead {
                state: handle.state(),
            }),
            None => Err(SchedulerError::ConsumerDead {
                state: RunnerState::Stopped,
            }),
        }
    }

    /// Stops the consumer, if any, and waits for its thread to exit.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.consumer.take() {
            handle.stop();
            let state = handle.join().await;
            info!("Kafka consumer exited ({:?})", state);
        }
    }

    async fn reconcile_consumer(&mut self) -> Result<(), SchedulerError> {
        let enabled = self.controls.consumer_enabled();
        let Some(handle) = self.consumer.as_ref() else {
            if enabled {
                return self.start_consumer().await;
            }
            return Ok(());
        };
        let stopping = handle.is_stop_requested();
        let alive = handle.is_alive();

        if enabled && stopping {
            // re-enabled before the previous runner was reaped
            self.reap_consumer().await;
            return self.start_consumer().await;
        }
        if !enabled && !stopping {
            handle.stop();
            info!("Kafka consumer will stop on next iteration");
        } else if !enabled && !alive {
            self.reap_consumer().await;
        }
        Ok(())
    }

    async fn reap_consumer(&mut self) {
        if let Some(handle) = self.consumer.take() {
            let state = handle.join().await;
            info!("Kafka consumer exited ({:?})", state);
        }
    }

    async fn start_consumer(&mut self) -> Result<(), SchedulerError> {
        let max_attempts = self.options.consumer_start_retries.max(1);
        let mut attempt = 0;

        loop {
            match self.runner.start() {
                Ok(mut handle) => match handle.wait_started().await {
                    RunnerState::Running => {
                        info!("Kafka consumer started successfully");
                        self.consumer = Some(handle);
                        return Ok(());
                    }
                    state => {
                        warn!("Kafka consumer exited during startup ({:?})", state);
                        handle.join().await;
                    }
                },
                Err(e) => error!("Failed to start consumer thread: {}", e),
            }

            attempt += 1;
            if attempt >= max_attempts {
                error!("Failed to start Kafka consumer after {} attempts", attempt);
                return Err(SchedulerError::ConsumerStart { attempts: attempt });
            }

            let wait = self.backoff.delay(attempt);
            warn!(
                "Failed to start Kafka consumer (attempt {}/{}). Retrying in {:?}...",
                attempt, max_attempts, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn run_due_jobs(&mut self) {
        let now = Instant::now();

        for slot in &mut self.jobs {
            if !slot.is_due(now) {
                continue;
            }
            slot.last_run = now;

            let name = slot.job.name().to_string();
            if !slot.job.is_enabled() {
                debug!("{} processing is disabled", name);
                continue;
            }

            debug!("Running {}", name);
            slot.runs += 1;
            slot.last_run_at = Some(chrono::Utc::now());

            let handler = slot.job.handler();
            // call inside the guard so a panic while building the future is caught too
            match guarded(async move { handler().await }).await {
                Ok(()) => {}
                Err(TaskFailure::Failed(e)) => {
                    slot.failures += 1;
                    error!("Error in {} processing: {:#}", name, e);
                }
                Err(TaskFailure::Panicked) => {
                    slot.failures += 1;
                    error!("{} processing panicked", name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ConsumerOptions, Every};
    use crate::consumer::router::Router;
    use crate::source::fake::{FakeConnector, PollStep};
    use crate::task::{TaskFn, task_fn};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TaskFn {
        let counter = counter.clone();
        task_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn consumer_runner(connector: Arc<FakeConnector>) -> ConsumerRunner<FakeConnector> {
        let options = ConsumerOptions {
            batch_timeout_ms: 50,
            poll_timeout_ms: 10,
            idle_sleep_ms: 10,
            error_sleep_ms: 10,
            connect_max_retries: 1,
            ..ConsumerOptions::default()
        };
        ConsumerRunner::new(
            connector,
            Arc::new(BrokerConfig::new(vec!["localhost:9092".to_string()], "test")),
            options,
            Router::with_default_routes(task_fn(|| async { Ok(()) })),
        )
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
    }

    fn scheduler(consumer_enabled: bool, connector: Arc<FakeConnector>) -> Scheduler<FakeConnector> {
        let options = SchedulerOptions {
            tick_interval_ms: 5000,
            consumer_enabled,
            consumer_start_retries: 2,
            jobs: vec![],
            ..SchedulerOptions::default()
        };
        Scheduler::new(options, consumer_runner(connector))
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_on_independent_intervals() {
        let fast = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler(false, Arc::default());
        scheduler
            .register(ScheduledJob::new("process_notifications", Every::seconds(30), counter_task(&fast)))
            .unwrap();
        scheduler
            .register(ScheduledJob::new("task1", Every::minutes(5), counter_task(&slow)))
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(601), scheduler.run()).await;

        assert_eq!(fast.load(Ordering::SeqCst), 20);
        assert_eq!(slow.load(Ordering::SeqCst), 2);
        let statuses = scheduler.job_statuses();
        assert_eq!(statuses[0].runs, 20);
        assert!(statuses[0].last_run_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_jobs_do_not_stop_the_loop() {
        let good = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler(false, Arc::default());
        scheduler
            .register(ScheduledJob::new(
                "broken",
                Every::seconds(5),
                task_fn(|| async { Err(anyhow::anyhow!("database unavailable")) }),
            ))
            .unwrap();
        scheduler
            .register(ScheduledJob::new(
                "buggy",
                Every::seconds(5),
                task_fn(|| async {
                    if true {
                        panic!("index out of bounds");
                    }
                    Ok(())
                }),
            ))
            .unwrap();
        scheduler
            .register(ScheduledJob::new("healthy", Every::seconds(5), counter_task(&good)))
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(31), scheduler.run()).await;

        assert_eq!(good.load(Ordering::SeqCst), 6);
        let statuses = scheduler.job_statuses();
        assert_eq!(statuses[0].failures, 6);
        assert_eq!(statuses[1].failures, 6);
        assert_eq!(statuses[2].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_panicking_before_its_future_does_not_stop_the_loop() {
        let good = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler(false, Arc::default());
        scheduler
            .register(ScheduledJob::new(
                "eager",
                Every::seconds(5),
                task_fn(|| {
                    if true {
                        panic!("failed to build job future");
                    }
                    async { Ok(()) }
                }),
            ))
            .unwrap();
        scheduler
            .register(ScheduledJob::new("healthy", Every::seconds(5), counter_task(&good)))
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(21), scheduler.run()).await;

        assert_eq!(good.load(Ordering::SeqCst), 4);
        let statuses = scheduler.job_statuses();
        assert_eq!(statuses[0].runs, 4);
        assert_eq!(statuses[0].failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_tick_interval_does_not_panic() {
        let mut scheduler = scheduler(false, Arc::default());
        scheduler.options.tick_interval_ms = 0;
        scheduler.controls().shutdown();
        assert!(scheduler.run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_job_is_skipped_until_enabled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler(false, Arc::default());
        scheduler
            .register(ScheduledJob::new("task2", Every::seconds(10), counter_task(&runs)).enabled(false))
            .unwrap();
        let controls = scheduler.controls();
        assert_eq!(controls.is_enabled("task2"), Some(false));

        let _ = tokio::time::timeout(Duration::from_secs(21), scheduler.run()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        controls.toggle("task2", true).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_toggle_and_register_errors() {
        let mut scheduler = scheduler(false, Arc::default());
        scheduler
            .register(ScheduledJob::new("task1", Every::minutes(5), task_fn(|| async { Ok(()) })))
            .unwrap();

        let duplicate =
            scheduler.register(ScheduledJob::new("task1", Every::minutes(1), task_fn(|| async { Ok(()) })));
        assert!(matches!(duplicate, Err(SchedulerError::DuplicateJob { .. })));

        let reserved =
            scheduler.register(ScheduledJob::new(CONSUMER_JOB, Every::minutes(1), task_fn(|| async { Ok(()) })));
        assert!(matches!(reserved, Err(SchedulerError::DuplicateJob { .. })));

        let controls = scheduler.controls();
        assert!(matches!(
            controls.toggle("nope", true),
            Err(SchedulerError::UnknownJob { .. })
        ));
        controls.toggle(CONSUMER_JOB, true).unwrap();
        assert!(controls.consumer_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_run() {
        let mut scheduler = scheduler(false, Arc::default());
        let controls = scheduler.controls();
        controls.shutdown();
        assert!(scheduler.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_consumer_is_fatal() {
        let mut steps: Vec<PollStep> = (0..10).map(|_| PollStep::Records(vec![])).collect();
        steps.push(PollStep::Fatal);
        let connector = Arc::new(FakeConnector::with_script(steps));
        let mut scheduler = scheduler(true, connector);
        scheduler.options.tick_interval_ms = 20;

        let result = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
            .await
            .expect("scheduler should fail fast");

        assert!(matches!(
            result,
            Err(SchedulerError::ConsumerDead {
                state: RunnerState::Dead
            })
        ));
    }

    #[tokio::test]
    async fn test_consumer_start_exhaustion_is_fatal() {
        let connector = Arc::new(FakeConnector::failing_connects(u32::MAX));
        let mut scheduler = scheduler(true, connector.clone());

        let result = scheduler.run().await;

        assert!(matches!(result, Err(SchedulerError::ConsumerStart { attempts: 2 })));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_start_retries_back_off_exponentially() {
        let connector = Arc::new(FakeConnector::failing_connects(u32::MAX));
        let runner = ConsumerRunner::new(
            connector.clone(),
            Arc::new(BrokerConfig::new(vec!["localhost:9092".to_string()], "test")),
            ConsumerOptions {
                connect_max_retries: 2,
                ..ConsumerOptions::default()
            },
            Router::default(),
        )
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)));
        let options = SchedulerOptions {
            consumer_start_retries: 3,
            jobs: vec![],
            ..SchedulerOptions::default()
        };
        let mut scheduler = Scheduler::new(options, runner);

        let start = Instant::now();
        let result = scheduler.run().await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(SchedulerError::ConsumerStart { attempts: 3 })));
        // each start attempt spends its own connect budget
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
        // 2s then 4s between the three start attempts, nothing after the last
        assert!(elapsed >= Duration::from_secs(6), "retried too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "retried too slow: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_consumer_toggle_never_overlaps_runners() {
        let connector = Arc::new(FakeConnector::default());
        let mut scheduler = scheduler(true, connector.clone());
        let controls = scheduler.controls();

        scheduler.tick().await.unwrap();
        assert_eq!(scheduler.consumer_state(), Some(RunnerState::Running));

        controls.toggle_consumer(false);
        scheduler.tick().await.unwrap();
        controls.toggle_consumer(true);
        scheduler.tick().await.unwrap();

        controls.toggle(CONSUMER_JOB, false).unwrap();
        controls.toggle(CONSUMER_JOB, true).unwrap();
        scheduler.tick().await.unwrap();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.max_live.load(Ordering::SeqCst), 1);
        assert!(scheduler.consumer().is_some_and(RunnerHandle::is_alive));

        scheduler.shutdown().await;
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_consumer_is_reaped() {
        let connector = Arc::new(FakeConnector::default());
        let mut scheduler = scheduler(true, connector.clone());
        let controls = scheduler.controls();
        scheduler.tick().await.unwrap();

        controls.toggle_consumer(false);
        scheduler.tick().await.unwrap();
        for _ in 0..100 {
            if !scheduler.consumer().is_some_and(RunnerHandle::is_alive) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.tick().await.unwrap();

        assert!(scheduler.consumer().is_none());
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
    }
}
