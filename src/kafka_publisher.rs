//! Kafka publisher for picture change events.
//!
//! Events are JSON encoded and keyed by picture id, so every change to one
//! picture lands on the same partition.

use crate::config::KafkaConfig;
use crate::events::{EventPublisher, PublishError};
use crate::model::ChangeEvent;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Build the producer ClientConfig from service configuration
pub fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();

    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("client.id", &config.client_id);
    client.set("security.protocol", &config.security_protocol);

    if let Some(ref ca) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca);
    }
    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }
    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }

    // Reliability settings
    client.set("acks", &config.acks);
    client.set("message.timeout.ms", config.message_timeout_ms.to_string());
    if config.enable_idempotence {
        client.set("enable.idempotence", "true");
    }

    client
}

fn classify_kafka(err: KafkaError) -> PublishError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => PublishError::QueueFull,
        Some(RDKafkaErrorCode::MessageTimedOut) | Some(RDKafkaErrorCode::RequestTimedOut) => {
            PublishError::Timeout(Duration::ZERO)
        }
        Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::NotLeaderForPartition)
        | Some(RDKafkaErrorCode::LeaderNotAvailable)
        | Some(RDKafkaErrorCode::NotEnoughReplicas) => PublishError::Unreachable(err.to_string()),
        _ => PublishError::Rejected(err.to_string()),
    }
}

/// Change event publisher backed by an rdkafka `FutureProducer`
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaEventPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        info!(
            "Creating Kafka producer for {} (topic {})",
            config.bootstrap_servers, config.topic
        );

        let producer: FutureProducer = producer_config(config)
            .create()
            .map_err(|e| PublishError::Unreachable(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            delivery_timeout: config.message_timeout(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| PublishError::Timeout(timeout))
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    #[instrument(skip(self, event), fields(picture_id = %event.picture_id, kind = %event.kind, version = event.version))]
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| PublishError::Serialization(e.to_string()))?;
        let key = event.picture_id.to_string();
        let event_id = event.event_id.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "message-type",
                value: Some(event.kind.as_str()),
            })
            .insert(Header {
                key: "event-id",
                value: Some(event_id.as_str()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| match classify_kafka(e) {
                PublishError::Timeout(_) => PublishError::Timeout(self.delivery_timeout),
                other => other,
            })?;

        debug!(partition, offset, "Change event delivered");
        Ok(())
    }
}

impl Drop for KafkaEventPublisher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
