use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{BrokerConfig, ConsumerOptions};
use crate::consumer::connect::ConnectionFactory;
use crate::consumer::poller::BatchPoller;
use crate::consumer::router::Router;
use crate::source::{Batch, Connection, Connector};
use crate::telemetry::ConsumerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunnerState {
    Stopped,
    Starting,
    Running,
    Dead,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Dead)
    }
}

/// Runs connect → poll → route on a dedicated thread with its own
/// single-threaded runtime, so nothing it does can stall the host's runtime.
pub struct ConsumerRunner<C: Connector> {
    connector: Arc<C>,
    broker: Arc<BrokerConfig>,
    options: ConsumerOptions,
    router: Router,
    backoff: Backoff,
}

impl<C: Connector> ConsumerRunner<C> {
    pub fn new(
        connector: Arc<C>,
        broker: Arc<BrokerConfig>,
        options: ConsumerOptions,
        router: Router,
    ) -> Self {
        Self {
            connector,
            broker,
            options,
            router,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.options.topics
    }

    /// Spawns the consumer thread. Connecting happens on that thread; watch
    /// [`RunnerHandle::state`] to learn how it went.
    pub fn start(&self) -> std::io::Result<RunnerHandle> {
        let (state_tx, state_rx) = watch::channel(RunnerState::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let metrics = Arc::new(Mutex::new(ConsumerMetrics::default()));

        let worker = ConsumerLoop {
            factory: ConnectionFactory::new(
                self.connector.clone(),
                self.options.connect_max_retries,
            )
            .with_backoff(self.backoff),
            broker: self.broker.clone(),
            options: self.options.clone(),
            router: self.router.clone(),
            metrics: metrics.clone(),
        };
        let publisher = StatePublisher { tx: state_tx };

        let thread = std::thread::Builder::new()
            .name("kafka-consumer".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build consumer runtime: {}", e);
                        // dropping the publisher marks the runner dead
                        return;
                    }
                };
                runtime.block_on(worker.run(&publisher, stop_rx));
            })?;

        debug!("Kafka consumer thread started");
        Ok(RunnerHandle {
            state: state_rx,
            stop: stop_tx,
            metrics,
            thread: Some(thread),
        })
    }
}

/// Owned by the consumer thread. If the thread unwinds or returns without
/// reaching a terminal state, dropping this marks the runner dead.
struct StatePublisher {
    tx: watch::Sender<RunnerState>,
}

impl StatePublisher {
    fn set(&self, state: RunnerState) {
        self.tx.send_replace(state);
    }
}

impl Drop for StatePublisher {
    fn drop(&mut self) {
        let current = *self.tx.borrow();
        if !current.is_terminal() {
            self.tx.send_replace(RunnerState::Dead);
        }
    }
}

struct ConsumerLoop<C: Connector> {
    factory: ConnectionFactory<C>,
    broker: Arc<BrokerConfig>,
    options: ConsumerOptions,
    router: Router,
    metrics: Arc<Mutex<ConsumerMetrics>>,
}

impl<C: Connector> ConsumerLoop<C> {
    async fn run(self, state: &StatePublisher, mut stop: watch::Receiver<bool>) {
        state.set(RunnerState::Starting);
        debug!("Starting Kafka consumer");

        let opened = tokio::select! {
            opened = self.factory.open(&self.options.topics, &self.broker) => opened,
            _ = stop_requested(&mut stop) => {
                info!("Kafka consumer stopped before it connected");
                state.set(RunnerState::Stopped);
                return;
            }
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to create consumer: {}", e);
                state.set(RunnerState::Dead);
                return;
            }
        };

        state.set(RunnerState::Running);
        info!("Kafka consumer running for topics {:?}", self.options.topics);

        let mut poller = BatchPoller::new(&self.options);
        let end_state = loop {
            // next_batch keeps its progress on the poller, so abandoning it
            // at an await point loses nothing that was already collected
            let polled = tokio::select! {
                polled = poller.next_batch(&mut conn) => polled,
                _ = stop_requested(&mut stop) => break RunnerState::Stopped,
            };

            match polled {
                Ok(batch) => self.process(batch, &mut conn).await,
                Err(e) if e.is_fatal() => {
                    error!("Kafka connection is unusable, stopping consumer: {}", e);
                    break RunnerState::Dead;
                }
                Err(e) => {
                    self.update_metrics(|m| m.poll_errors += 1);
                    error!("Consumer error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.error_sleep()) => {}
                        _ = stop_requested(&mut stop) => break RunnerState::Stopped,
                    }
                }
            }
        };

        let pending = poller.flush();
        if !pending.is_empty() {
            debug!("Routing {} pending records before exit", pending.len());
            self.process(pending, &mut conn).await;
        }

        match end_state {
            RunnerState::Stopped => info!("Kafka consumer stopped"),
            _ => error!("Kafka consumer died"),
        }
        drop(conn);
        state.set(end_state);
    }

    async fn process(&self, batch: Batch, conn: &mut C::Connection) {
        let size = batch.len();
        let malformed = conn.take_malformed();
        let summary = self.router.route(batch).await;
        self.update_metrics(|m| {
            m.record_batch(&summary);
            m.record_malformed(malformed);
        });
        debug!(
            "Successfully processed batch of {} messages ({} routed, {} skipped, {} unhandled, {} malformed)",
            size, summary.routed, summary.skipped, summary.unhandled, malformed
        );

        if !self.broker.enable_auto_commit {
            match conn.commit().await {
                Ok(()) => self.update_metrics(|m| m.commits += 1),
                Err(e) => warn!("Failed to commit offsets: {}", e),
            }
        }
    }

    fn update_metrics(&self, f: impl FnOnce(&mut ConsumerMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut metrics);
    }
}

/// Resolves once a stop was requested or the handle was dropped.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Supervisor's view of a running consumer.
pub struct RunnerHandle {
    state: watch::Receiver<RunnerState>,
    stop: watch::Sender<bool>,
    metrics: Arc<Mutex<ConsumerMetrics>>,
    thread: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Asks the runner to stop. It finishes the batch in hand and exits at
    /// its next await point.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Waits until the runner either connected or gave up.
    pub async fn wait_started(&mut self) -> RunnerState {
        match self
            .state
            .wait_for(|state| *state != RunnerState::Starting)
            .await
        {
            Ok(state) => *state,
            Err(_) => RunnerState::Dead,
        }
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Waits for the consumer thread to exit and returns its final state.
    pub async fn join(mut self) -> RunnerState {
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("Kafka consumer thread panicked"),
                Err(e) => warn!("Failed to join Kafka consumer thread: {}", e),
            }
        }
        self.state()
    }
}
