//! Redpanda/Kafka event stream client for the on-demand test proxy.
//!
//! This crate provides the Kafka-backed implementation of the [`EventBus`]
//! trait from `ondemand-proxy-core`. It uses rdkafka, so it works against any
//! Kafka-compatible broker (Apache Kafka, Redpanda, MSK, ...).
//!
//! # Delivery Semantics
//!
//! The proxy consumes the backend's event topic purely to observe completion
//! events for requests that are in flight right now, so this client:
//! - assigns **every partition** of the topic explicitly, positioned at its
//!   current high watermark (no historical replay, no group rebalancing delay)
//! - never commits offsets (a restarted proxy has no in-flight requests to
//!   resume, so replaying old events would only be noise)
//! - uses a per-process consumer group id unless one is configured, so
//!   several proxy instances each see every event
//!
//! `subscribe` resolves only after the watermarks have been read and the
//! partitions assigned at those concrete offsets, so every message produced
//! after it returns is delivered. The correlation bridge relies on this to be
//! listening before any backend call is issued.
//!
//! # Example
//!
//! ```no_run
//! use ondemand_proxy_redpanda::RedpandaEventBus;
//! use ondemand_proxy_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::new("voltha-kafka.voltha:9092")?;
//!
//! let mut stream = event_bus.subscribe("voltha.events").await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("Received: {:?}", event.kind),
//!         Err(e) => eprintln!("Error: {}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use ondemand_proxy_core::event_bus::{EventBus, EventBusError, EventStream, decode_message};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda/Kafka event bus implementation.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Consumer group**: Explicit ID or a per-process generated one
/// - **Buffer size**: Event buffer capacity between consumer and subscriber (default: 1000)
/// - **Offset reset**: Fallback policy if the end offset cannot be resolved (default: "latest")
/// - **Security**: `security.protocol` and CA location for TLS brokers
///
/// # Example
///
/// ```no_run
/// use ondemand_proxy_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .buffer_size(5000)
///     .metadata_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Timeout for the topic metadata lookup done while subscribing
    metadata_timeout: Duration,
    /// Consumer group ID
    consumer_group: String,
    /// Event buffer size for subscribers
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
    /// `security.protocol` for broker connections
    security_protocol: String,
    /// CA certificate used to verify brokers when TLS is enabled
    ssl_ca_location: Option<String>,
}

impl RedpandaEventBus {
    /// Create a new event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Get the consumer group id used for subscriptions.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("client.id", "ondemand-proxy-consumer")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set("security.protocol", &self.security_protocol);
        if let Some(ca) = &self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        config
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    security_protocol: Option<String>,
    ssl_ca_location: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated, e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how long `subscribe` waits for topic metadata.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID.
    ///
    /// If not set, a unique `ondemand-proxy-<uuid>` group is generated so that
    /// every proxy process receives every event.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the event buffer size for subscriptions.
    ///
    /// A size of 0 is treated as 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the auto offset reset policy ("latest", "earliest" or "error").
    ///
    /// Partitions are assigned at their end offset; this policy only applies
    /// when that offset turns out to be invalid.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the broker security protocol ("plaintext", "ssl", ...).
    #[must_use]
    pub fn security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set the CA certificate file used to verify TLS brokers.
    #[must_use]
    pub fn ssl_ca_location(mut self, path: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(path.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let security_protocol = self
            .security_protocol
            .unwrap_or_else(|| "plaintext".to_string());

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("security.protocol", &security_protocol);
        if let Some(ca) = &self.ssl_ca_location {
            producer_config.set("ssl.ca.location", ca);
        }

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| format!("ondemand-proxy-{}", uuid::Uuid::new_v4()));

        tracing::info!(
            brokers = %brokers,
            consumer_group = %consumer_group,
            security_protocol = %security_protocol,
            buffer_size = self.buffer_size.unwrap_or(1000),
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            metadata_timeout: self.metadata_timeout.unwrap_or(Duration::from_secs(10)),
            consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
            security_protocol,
            ssl_ca_location: self.ssl_ca_location,
        })
    }
}

/// Create a consumer with every partition of `topic` assigned at its high
/// watermark.
///
/// Blocking: performs metadata and watermark round trips to the brokers.
fn assign_at_end(
    config: &ClientConfig,
    topic: &str,
    metadata_timeout: Duration,
) -> Result<StreamConsumer, EventBusError> {
    let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
        topic: topic.to_string(),
        reason,
    };

    let consumer: StreamConsumer = config
        .create()
        .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

    let metadata = consumer
        .fetch_metadata(Some(topic), Timeout::After(metadata_timeout))
        .map_err(|e| subscription_failed(format!("Failed to fetch topic metadata: {e}")))?;

    let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Err(subscription_failed("Topic not present in metadata".to_string()));
    };
    if let Some(err) = topic_metadata.error() {
        return Err(subscription_failed(format!("Topic metadata error: {err:?}")));
    }
    if topic_metadata.partitions().is_empty() {
        return Err(subscription_failed("Topic has no partitions".to_string()));
    }

    let mut high_watermarks = Vec::with_capacity(topic_metadata.partitions().len());
    for partition in topic_metadata.partitions() {
        let (_, high) = consumer
            .fetch_watermarks(topic, partition.id(), Timeout::After(metadata_timeout))
            .map_err(|e| {
                subscription_failed(format!(
                    "Failed to fetch watermarks for partition {}: {e}",
                    partition.id()
                ))
            })?;
        high_watermarks.push((partition.id(), high));
    }

    let assignment = assignment_at(topic, &high_watermarks)
        .map_err(|e| subscription_failed(format!("Invalid partition offset: {e}")))?;
    consumer
        .assign(&assignment)
        .map_err(|e| subscription_failed(format!("Failed to assign partitions: {e}")))?;

    tracing::info!(
        topic = %topic,
        partitions = topic_metadata.partitions().len(),
        "Assigned all partitions at their high watermark"
    );

    Ok(consumer)
}

/// Assignment positioning each `(partition, offset)` at that concrete offset.
fn assignment_at(
    topic: &str,
    offsets: &[(i32, i64)],
) -> Result<TopicPartitionList, rdkafka::error::KafkaError> {
    let mut assignment = TopicPartitionList::new();
    for &(partition, offset) in offsets {
        assignment.add_partition_offset(topic, partition, Offset::Offset(offset))?;
    }
    Ok(assignment)
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = payload.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(&topic).payload(&payload);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let config = self.consumer_config();
        let buffer_size = self.buffer_size;
        let metadata_timeout = self.metadata_timeout;

        Box::pin(async move {
            let assign_topic = topic.clone();
            let consumer = tokio::task::spawn_blocking(move || {
                assign_at_end(&config, &assign_topic, metadata_timeout)
            })
            .await
            .map_err(|e| EventBusError::SubscriptionFailed {
                topic: topic.clone(),
                reason: format!("Subscription task failed: {e}"),
            })??;

            tracing::info!(
                topic = %topic,
                consumer_group = %self.consumer_group,
                buffer_size = buffer_size,
                "Subscribed to topic"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task owns the consumer; it ends when the subscriber drops the stream.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    let item = match msg_result {
                        Ok(message) => match message.payload() {
                            Some(payload) => {
                                let decoded = decode_message(payload);
                                if decoded.is_ok() {
                                    tracing::trace!(
                                        topic = message.topic(),
                                        partition = message.partition(),
                                        offset = message.offset(),
                                        "Received event"
                                    );
                                }
                                decoded
                            },
                            None => Err(EventBusError::DeserializationFailed(
                                "Message has no payload".to_string(),
                            )),
                        },
                        Err(e) => Err(EventBusError::TransportError(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    if tx.send(item).await.is_err() {
                        tracing::debug!("Subscriber dropped, exiting consumer task");
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}
