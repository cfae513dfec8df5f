use futures::FutureExt;
use futures::stream::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::errors::{KafkaError, SourceError};
use crate::source::{Connection, Connector, Record};

/// Opens rdkafka stream consumers.
#[derive(Debug, Default, Clone)]
pub struct KafkaConnector;

impl Connector for KafkaConnector {
    type Connection = KafkaConnection;

    fn connect(
        &self,
        topics: &[String],
        config: &BrokerConfig,
    ) -> Result<KafkaConnection, SourceError> {
        KafkaConnection::new(topics, config)
    }
}

pub struct KafkaConnection {
    consumer: StreamConsumer,
    probe_timeout: Duration,
    malformed: usize,
}

pub fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.group_id)
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", config.auto_offset_reset.as_str())
        .set("enable.auto.commit", config.enable_auto_commit.to_string())
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("socket.timeout.ms", config.request_timeout_ms.to_string());

    if let Some(version) = &config.protocol_version {
        client_config.set("broker.version.fallback", version);
    }

    if let Some(security_protocol) = &config.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &config.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &config.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

impl KafkaConnection {
    pub fn new(topics: &[String], config: &BrokerConfig) -> Result<Self, SourceError> {
        let consumer: StreamConsumer =
            client_config(config)
                .create()
                .map_err(|e| SourceError::Connection {
                    source: Box::new(KafkaError::ConsumerCreation {
                        reason: e.to_string(),
                    }),
                })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| SourceError::Connection {
                source: Box::new(KafkaError::Subscription {
                    topics: topics.to_vec(),
                    reason: e.to_string(),
                }),
            })?;

        info!("Subscribed to Kafka topics: {:?}", topics);
        Ok(Self {
            consumer,
            probe_timeout: config.request_timeout(),
            malformed: 0,
        })
    }
}

impl Connection for KafkaConnection {
    async fn probe(&self) -> Result<(), SourceError> {
        let metadata = self
            .consumer
            .fetch_metadata(None, self.probe_timeout)
            .map_err(|e| SourceError::Connection {
                source: Box::new(KafkaError::HealthCheck {
                    reason: e.to_string(),
                }),
            })?;

        if metadata.brokers().is_empty() {
            return Err(SourceError::Connection {
                source: Box::new(KafkaError::HealthCheck {
                    reason: "no brokers in cluster metadata".to_string(),
                }),
            });
        }

        debug!(
            "Health check passed: {} brokers, {} topics visible",
            metadata.brokers().len(),
            metadata.topics().len()
        );
        Ok(())
    }

    async fn poll(
        &mut self,
        poll_timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, SourceError> {
        let mut records = Vec::new();
        let mut stream = self.consumer.stream();

        let first = match timeout(poll_timeout, stream.next()).await {
            Err(_) => return Ok(records),
            Ok(None) => {
                return Err(SourceError::Unrecoverable(Box::new(KafkaError::StreamClosed)));
            }
            Ok(Some(result)) => result.map_err(classify)?,
        };
        if !push_decoded(&mut records, &first) {
            self.malformed += 1;
        }

        // Drain whatever the client already has buffered without waiting again.
        while records.len() < max_records {
            match stream.next().now_or_never() {
                Some(Some(Ok(message))) => {
                    if !push_decoded(&mut records, &message) {
                        self.malformed += 1;
                    }
                }
                Some(Some(Err(e))) => {
                    warn!("Error receiving message: {}", e);
                    break;
                }
                Some(None) | None => break,
            }
        }

        Ok(records)
    }

    async fn commit(&mut self) -> Result<(), SourceError> {
        match self.consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => Ok(()),
            // nothing consumed since the last commit
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => Ok(()),
            Err(e) => Err(SourceError::Transient {
                source: Box::new(KafkaError::OffsetCommit {
                    reason: e.to_string(),
                }),
            }),
        }
    }

    fn take_malformed(&mut self) -> usize {
        std::mem::take(&mut self.malformed)
    }
}

fn classify(err: RdKafkaError) -> SourceError {
    let fatal = matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Fatal)
            | Some(RDKafkaErrorCode::Authentication)
            | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
    );
    let source = Box::new(KafkaError::Consumption {
        reason: err.to_string(),
    });
    if fatal {
        SourceError::Unrecoverable(source)
    } else {
        SourceError::Transient { source }
    }
}

/// Returns false when the message was dropped as undecodable.
fn push_decoded(records: &mut Vec<Record>, message: &BorrowedMessage<'_>) -> bool {
    match decode_payload(message.payload()) {
        Ok(payload) => {
            records.push(Record {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload,
            });
            true
        }
        Err(e) => {
            warn!(
                "Skipping undecodable message on {} partition {} offset {}: {}",
                message.topic(),
                message.partition(),
                message.offset(),
                e
            );
            false
        }
    }
}

pub fn decode_payload(payload: Option<&[u8]>) -> Result<Value, KafkaError> {
    let bytes = payload.ok_or_else(|| KafkaError::MessageParsing {
        reason: "Message payload is empty".to_string(),
    })?;

    serde_json::from_slice(bytes).map_err(|e| KafkaError::MessageParsing {
        reason: format!("Failed to parse message payload as JSON: {e}"),
    })
}
