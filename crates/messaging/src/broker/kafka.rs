//! Kafka transport (feature `kafka`).
//!
//! Producer: `acks=all` with idempotence, key and headers preserved.
//! Consumer: manual offset commit, one `StreamConsumer` per subscription.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};

use super::{Broker, Delivery, StartOffset, Subscription};
use crate::envelope::{Headers, Message};
use crate::{MessagingError, Result};

/// Connection settings for a Kafka cluster.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub bootstrap_servers: String,
    /// How long a send may wait for acknowledgement.
    pub message_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            message_timeout: Duration::from_secs(5),
        }
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config
    }

    fn consumer_config(&self, group_id: &str, start: StartOffset) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set(
            "auto.offset.reset",
            match start {
                StartOffset::Committed => "earliest",
                StartOffset::Latest => "latest",
            },
        );
        config
    }
}

/// Broker backed by a Kafka cluster.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config.producer_config().create().map_err(|e| {
            MessagingError::BrokerUnavailable(format!("failed to create Kafka producer: {e}"))
        })?;

        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            "connected to Kafka"
        );

        Ok(Self { producer, config })
    }
}

fn classify(topic: &str, err: KafkaError) -> MessagingError {
    match err {
        KafkaError::MessageProduction(code) => MessagingError::Rejected {
            topic: topic.to_string(),
            reason: code.to_string(),
        },
        other => MessagingError::BrokerUnavailable(other.to_string()),
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn send(&self, message: Message) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.value)
            .headers(headers);

        self.producer
            .send(record, self.config.message_timeout)
            .await
            .map_err(|(e, _)| classify(&message.topic, e))?;

        tracing::debug!(topic = %message.topic, "published to Kafka");
        Ok(())
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        start: StartOffset,
    ) -> Result<Box<dyn Subscription>> {
        let consumer: StreamConsumer = self
            .config
            .consumer_config(group_id, start)
            .create()
            .map_err(|e| MessagingError::Subscribe(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::Subscribe(format!("failed to subscribe to {topic}: {e}")))?;

        tracing::info!(group_id, topic, "subscribed to Kafka topic");
        Ok(Box::new(KafkaSubscription { consumer }))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let mut headers = Headers::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    Delivery {
        message: Message {
            topic: message.topic().to_string(),
            key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
            value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        },
        partition: u32::try_from(message.partition()).unwrap_or_default(),
        offset: u64::try_from(message.offset()).unwrap_or_default(),
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Result<Delivery> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| MessagingError::BrokerUnavailable(e.to_string()))?;
        Ok(to_delivery(&message))
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.message.topic,
                delivery.partition as i32,
                Offset::Offset(delivery.offset as i64 + 1),
            )
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| MessagingError::BrokerUnavailable(e.to_string()))
    }
}
