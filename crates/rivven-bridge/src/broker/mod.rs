//! Broker collaborator interfaces
//!
//! The bridge never speaks a broker wire protocol itself. Endpoints drive a
//! [`BrokerConsumer`] or a [`BrokerProducer`] obtained from a [`BrokerClient`].
//!
//! Backends:
//! - [`memory::MemoryBroker`]: in-process partitioned log with consumer groups
//! - `kafka::KafkaBroker` (feature `kafka`): producer backend over the Kafka protocol

pub mod memory;
pub mod partitioner;
pub mod retry;

#[cfg(feature = "kafka")]
pub mod kafka;

use crate::config::{BrokerBackend, BrokerConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by broker collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Topic does not exist
    #[error("Topic {0} not present in metadata")]
    UnknownTopic(String),

    /// Partition does not exist in an existing topic
    #[error("Partition {partition} of topic {topic} does not exist")]
    UnknownPartition { topic: String, partition: u32 },

    /// Request timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection to the broker failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Operation not offered by this backend
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Client was closed
    #[error("Client closed")]
    Closed,
}

impl BrokerError {
    /// Check if the error means the topic is unknown to the broker
    ///
    /// Some clients only surface a missing topic as a metadata timeout, so the
    /// timeout message is inspected as well.
    pub fn is_unknown_topic(&self) -> bool {
        match self {
            Self::UnknownTopic(_) => true,
            Self::Timeout(msg) => msg.contains("not present in metadata"),
            _ => false,
        }
    }

    /// Whether the same request may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Timeout(_) => !self.is_unknown_topic(),
            _ => false,
        }
    }
}

/// A topic partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Partition metadata returned by a partition lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: u32,
}

/// A record read from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    pub timestamp: DateTime<Utc>,
}

/// A record to be written to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; chosen by the partitioner when absent
    pub partition: Option<u32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Broker acknowledgement of a stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
}

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// Settings of a consumer created for a sink link
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub client_id: String,
    pub max_poll_records: usize,
    pub offset_reset: OffsetReset,
}

/// What a poll observed
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// Group assignment handed these partitions to the consumer
    PartitionsAssigned(Vec<TopicPartition>),
    /// Group rebalance took these partitions away
    PartitionsRevoked(Vec<TopicPartition>),
    /// Records fetched from assigned partitions, possibly none
    Records(Vec<ConsumerRecord>),
}

/// Factory for consumers and producers of one broker
pub trait BrokerClient: Send + Sync {
    /// Create a consumer belonging to a consumer group
    fn create_consumer(
        &self,
        settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Create a producer
    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError>;
}

/// A consumer owned by exactly one sink endpoint
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Join the group for these topics; assignment arrives through [`poll`](Self::poll)
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Partitions of a topic
    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionInfo>, BrokerError>;

    /// Take partitions directly, bypassing group assignment
    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Move the read position of an assigned partition
    async fn seek(&mut self, partition: &TopicPartition, offset: u64) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for assignment changes or records
    async fn poll(&mut self, timeout: Duration) -> Result<ConsumerEvent, BrokerError>;

    /// Commit next-to-read offsets for the consumer group
    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, u64>)
        -> Result<(), BrokerError>;

    /// Leave the group and release resources
    async fn close(&mut self);
}

/// A producer shared by the sends of one endpoint
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError>;

    async fn close(&self);
}

/// Shared broker client
pub type SharedBrokerClient = Arc<dyn BrokerClient>;

/// Connect to the configured broker backend
pub async fn connect(config: &BrokerConfig) -> crate::error::Result<SharedBrokerClient> {
    match config.backend {
        BrokerBackend::Memory => Ok(Arc::new(memory::MemoryBroker::new(
            memory::MemoryBrokerConfig {
                auto_create_topics: config.auto_create_topics,
                default_partitions: config.default_partitions,
            },
        ))),
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => Ok(Arc::new(kafka::KafkaBroker::connect(config).await?)),
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => Err(crate::error::BridgeError::config(
            "kafka backend requires the 'kafka' feature",
        )),
    }
}
