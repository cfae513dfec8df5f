use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info};
use worker_core::config::{BrokerConfig, WorkerConfig, load_config};
use worker_core::consumer::{ConsumerRunner, Router};
use worker_core::errors::WorkerError;
use worker_core::scheduler::{ScheduledJob, Scheduler};
use worker_core::source::kafka::KafkaConnector;
use worker_core::task::{TaskFn, task_fn};
use worker_core::telemetry::init_tracing;

const NOTIFICATIONS_JOB: &str = "process_notifications";

/// This is the entry point for running the background worker as a long-lived
/// process on container hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config (path as first argument, else from the environment).
///     Main loop runs until a shutdown signal is received:
///         - run the scheduler, which starts and supervises the Kafka consumer
///         - if the consumer subsystem dies, rebuild it after a short pause
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load worker configuration")?;
    let broker = Arc::new(config.broker.clone());

    loop {
        let mut scheduler = build_scheduler(&config, &broker)?;

        let result = tokio::select! {
            result = scheduler.run() => result,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                scheduler.shutdown().await;
                return Ok(());
            }
        };

        match result.map_err(WorkerError::from) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_restartable() => {
                let delay = config.scheduler.restart_delay();
                error!("Background subsystem died, restarting in {:?}: {}", delay, e);
                drop(scheduler);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("Scheduler failed"),
        }
    }
}

fn build_scheduler(
    config: &WorkerConfig,
    broker: &Arc<BrokerConfig>,
) -> Result<Scheduler<KafkaConnector>> {
    let process_notifications = notification_processor();

    let runner = ConsumerRunner::new(
        Arc::new(KafkaConnector),
        broker.clone(),
        config.consumer.clone(),
        Router::with_default_routes(process_notifications.clone()),
    );
    let mut scheduler = Scheduler::new(config.scheduler.clone(), runner);

    for job in &config.scheduler.jobs {
        let handler = match job.name.as_str() {
            NOTIFICATIONS_JOB => process_notifications.clone(),
            name => periodic_task(name),
        };
        scheduler
            .register(ScheduledJob::from_config(job, handler))
            .with_context(|| format!("Failed to register job {}", job.name))?;
    }

    Ok(scheduler)
}

/// Delivery of due notifications belongs to the host application; this
/// binary only triggers it.
fn notification_processor() -> TaskFn {
    task_fn(|| async {
        info!("Processing due notifications");
        Ok(())
    })
}

fn periodic_task(name: &str) -> TaskFn {
    let name = name.to_string();
    task_fn(move || {
        let name = name.clone();
        async move {
            debug!("Running {}", name);
            Ok(())
        }
    })
}
