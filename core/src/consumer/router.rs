use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::errors::RouteError;
use crate::source::{Batch, Record};
use crate::task::TaskFn;

pub const NOTIFICATIONS_TOPIC: &str = "notifications";
pub const GENERIC_TOPIC: &str = "generic_topic";

/// Handles every record of one topic.
pub trait TopicHandler: Send + Sync {
    fn handle<'a>(&'a self, record: &'a Record) -> BoxFuture<'a, Result<(), RouteError>>;
}

/// Validates notification events and hands off to the notification processor.
pub struct NotificationHandler {
    process_notifications: TaskFn,
}

impl NotificationHandler {
    pub const REQUIRED_FIELDS: [&'static str; 3] = ["user_id", "event", "content"];

    pub fn new(process_notifications: TaskFn) -> Self {
        Self {
            process_notifications,
        }
    }
}

impl TopicHandler for NotificationHandler {
    fn handle<'a>(&'a self, record: &'a Record) -> BoxFuture<'a, Result<(), RouteError>> {
        async move {
            let missing = missing_fields(&record.payload, &Self::REQUIRED_FIELDS);
            if !missing.is_empty() {
                return Err(RouteError::MissingFields {
                    topic: record.topic.clone(),
                    fields: missing,
                });
            }

            (self.process_notifications)()
                .await
                .map_err(|error| RouteError::Handler {
                    topic: record.topic.clone(),
                    error,
                })
        }
        .boxed()
    }
}

pub struct GenericHandler;

impl TopicHandler for GenericHandler {
    fn handle<'a>(&'a self, record: &'a Record) -> BoxFuture<'a, Result<(), RouteError>> {
        async move {
            debug!("Processing generic topic message: {}", record.payload);
            Ok(())
        }
        .boxed()
    }
}

/// A key counts as missing when it is absent, `null` or an empty string.
pub fn missing_fields(payload: &Value, required: &[&'static str]) -> Vec<&'static str> {
    required
        .iter()
        .copied()
        .filter(|field| match payload.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub routed: usize,
    pub skipped: usize,
    pub unhandled: usize,
}

/// Topic-keyed dispatch table.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// The routes the background worker subscribes with out of the box.
    pub fn with_default_routes(process_notifications: TaskFn) -> Self {
        Self::new()
            .with_handler(
                NOTIFICATIONS_TOPIC,
                NotificationHandler::new(process_notifications),
            )
            .with_handler(GENERIC_TOPIC, GenericHandler)
    }

    pub fn with_handler(mut self, topic: &str, handler: impl TopicHandler + 'static) -> Self {
        self.handlers.insert(topic.to_string(), Arc::new(handler));
        self
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Routes every record in order. Failures are logged per record and
    /// never cut the batch short.
    pub async fn route(&self, batch: Batch) -> RouteSummary {
        let mut summary = RouteSummary::default();

        for record in &batch {
            debug!(
                "Processing message from batch: {} - {}",
                record.topic, record.payload
            );

            let Some(handler) = self.handlers.get(&record.topic) else {
                warn!("Unhandled message topic: {}", record.topic);
                summary.unhandled += 1;
                continue;
            };

            match AssertUnwindSafe(handler.handle(record)).catch_unwind().await {
                Ok(Ok(())) => summary.routed += 1,
                Ok(Err(e)) => {
                    error!(
                        "Error processing message at {}/{} offset {}: {}",
                        record.topic, record.partition, record.offset, e
                    );
                    summary.skipped += 1;
                }
                Err(_) => {
                    error!(
                        "{}",
                        RouteError::Panicked {
                            topic: record.topic.clone()
                        }
                    );
                    summary.skipped += 1;
                }
            }
        }

        summary
    }
}
