//! The Kafka side of the background worker: connect, batch, route.

pub mod connect;
pub mod poller;
pub mod router;
pub mod runner;

pub use connect::ConnectionFactory;
pub use poller::BatchPoller;
pub use router::{GenericHandler, NotificationHandler, RouteSummary, Router, TopicHandler};
pub use runner::{ConsumerRunner, RunnerHandle, RunnerState};
