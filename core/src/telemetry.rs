use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::consumer::router::RouteSummary;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker_core=info,worker_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerMetrics {
    pub batches_processed: usize,
    pub records_routed: usize,
    pub records_skipped: usize,
    pub records_unhandled: usize,
    pub poll_errors: usize,
    pub commits: usize,
}

impl ConsumerMetrics {
    pub fn record_batch(&mut self, summary: &RouteSummary) {
        self.batches_processed += 1;
        self.records_routed += summary.routed;
        self.records_skipped += summary.skipped;
        self.records_unhandled += summary.unhandled;
    }

    /// Messages dropped before routing because their payload was unusable.
    pub fn record_malformed(&mut self, count: usize) {
        self.records_skipped += count;
    }
}
