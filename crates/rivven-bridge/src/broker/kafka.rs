//! Kafka protocol backend
//!
//! Built on [rskafka](https://crates.io/crates/rskafka), a pure Rust client.
//! rskafka has no consumer-group coordinator, so:
//! - sink links must pin a partition (`assign`/`seek`); group subscription is
//!   refused with [`BrokerError::Unsupported`]
//! - group offsets are committed into this broker handle and survive link
//!   re-attaches within one bridge process, not restarts
//!
//! Partition counts are cached per topic and refreshed only when a send names
//! a partition the cache does not know or the broker reports the topic
//! missing.

use super::partitioner::Partitioner;
use super::retry::{retry, RetryConfig};
use super::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, ConsumerEvent, ConsumerRecord,
    ConsumerSettings, OffsetReset, PartitionInfo, ProducerRecord, RecordMetadata, TopicPartition,
};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rskafka::client::error::{Error as KafkaError, ProtocolError};
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::{Record, RecordAndOffset};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound of one fetch response
const MAX_FETCH_BYTES: i32 = 10 * 1024 * 1024;

/// Client plus per-topic caches shared by every consumer and producer
struct KafkaShared {
    client: Client,
    partition_clients: tokio::sync::Mutex<HashMap<(String, u32), Arc<PartitionClient>>>,
    partition_counts: parking_lot::Mutex<HashMap<String, u32>>,
    /// group id -> committed next offsets
    group_offsets: parking_lot::Mutex<HashMap<String, BTreeMap<TopicPartition, u64>>>,
}

impl KafkaShared {
    fn new(client: Client) -> Self {
        Self {
            client,
            partition_clients: tokio::sync::Mutex::new(HashMap::new()),
            partition_counts: parking_lot::Mutex::new(HashMap::new()),
            group_offsets: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_partition_count(&self, topic: &str) -> Result<u32, BrokerError> {
        let topics = self
            .client
            .list_topics()
            .await
            .map_err(|e| map_error(topic, e))?;
        let count = topics
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions.len() as u32)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        self.partition_counts
            .lock()
            .insert(topic.to_string(), count);
        debug!("Topic {} has {} partitions", topic, count);
        Ok(count)
    }

    /// Cached partition count, fetched on first use
    async fn partition_count(&self, topic: &str) -> Result<u32, BrokerError> {
        let cached = self.partition_counts.lock().get(topic).copied();
        match cached {
            Some(count) => Ok(count),
            None => self.fetch_partition_count(topic).await,
        }
    }

    async fn partition_client(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<Arc<PartitionClient>, BrokerError> {
        let mut clients = self.partition_clients.lock().await;
        if let Some(client) = clients.get(&(topic.to_string(), partition)) {
            return Ok(Arc::clone(client));
        }
        let client = self
            .client
            .partition_client(topic, partition as i32, UnknownTopicHandling::Error)
            .await
            .map_err(|e| map_error(topic, e))?;
        let client = Arc::new(client);
        clients.insert((topic.to_string(), partition), Arc::clone(&client));
        debug!("Opened partition client for {}[{}]", topic, partition);
        Ok(client)
    }

    /// Drop cached metadata of a topic the broker no longer agrees with
    async fn forget_topic(&self, topic: &str) {
        self.partition_counts.lock().remove(topic);
        self.partition_clients
            .lock()
            .await
            .retain(|(name, _), _| name != topic);
    }
}

/// Translate a client error, naming the topic it concerned
fn map_error(topic: &str, e: KafkaError) -> BrokerError {
    match e {
        KafkaError::ServerError {
            protocol_error: ProtocolError::UnknownTopicOrPartition,
            ..
        } => BrokerError::UnknownTopic(topic.to_string()),
        e @ KafkaError::ServerError { .. } => BrokerError::Rejected(e.to_string()),
        KafkaError::Timeout => BrokerError::Timeout(format!("request for {} timed out", topic)),
        other => BrokerError::Connection(other.to_string()),
    }
}

fn offset_at(reset: OffsetReset) -> OffsetAt {
    match reset {
        OffsetReset::Earliest => OffsetAt::Earliest,
        OffsetReset::Latest => OffsetAt::Latest,
    }
}

fn to_consumer_record(topic: &str, partition: u32, fetched: RecordAndOffset) -> ConsumerRecord {
    let RecordAndOffset { record, offset } = fetched;
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset: offset.max(0) as u64,
        key: record.key.map(Bytes::from),
        value: record.value.map(Bytes::from).unwrap_or_default(),
        headers: record
            .headers
            .into_iter()
            .map(|(name, value)| (name, Bytes::from(value)))
            .collect(),
        timestamp: record.timestamp,
    }
}

/// Broker reached over the Kafka wire protocol
///
/// Consumers and producers created from one broker share its metadata caches
/// and partitioner state.
pub struct KafkaBroker {
    shared: Arc<KafkaShared>,
    partitioner: Arc<Partitioner>,
}

impl KafkaBroker {
    /// Connect to the first reachable bootstrap server, retrying with backoff
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let timeout = Duration::from_millis(config.connection_timeout_ms);
        let servers = config.bootstrap_servers.clone();
        let retry_config = RetryConfig::default().with_max_retries(config.connect_retries);

        let client = retry(&retry_config, "Kafka connect", || {
            let servers = servers.clone();
            async move {
                let builder = ClientBuilder::new(servers.clone());
                match tokio::time::timeout(timeout, builder.build()).await {
                    Ok(Ok(client)) => Ok(client),
                    Ok(Err(e)) => Err(BrokerError::Connection(e.to_string())),
                    Err(_) => Err(BrokerError::Timeout(format!(
                        "connecting to {:?} timed out",
                        servers
                    ))),
                }
            }
        })
        .await?;

        info!("Connected to Kafka brokers {:?}", config.bootstrap_servers);
        Ok(Self {
            shared: Arc::new(KafkaShared::new(client)),
            partitioner: Arc::new(Partitioner::new()),
        })
    }
}

impl BrokerClient for KafkaBroker {
    fn create_consumer(
        &self,
        settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        Ok(Box::new(KafkaConsumer {
            shared: Arc::clone(&self.shared),
            settings,
            positions: BTreeMap::new(),
            closed: false,
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        Ok(Arc::new(KafkaProducer {
            shared: Arc::clone(&self.shared),
            partitioner: Arc::clone(&self.partitioner),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Consumer of explicitly assigned partitions
pub struct KafkaConsumer {
    shared: Arc<KafkaShared>,
    settings: ConsumerSettings,
    /// next offset to fetch per assigned partition
    positions: BTreeMap<TopicPartition, i64>,
    closed: bool,
}

impl KafkaConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn committed(&self, tp: &TopicPartition) -> Option<u64> {
        self.shared
            .group_offsets
            .lock()
            .get(&self.settings.group_id)
            .and_then(|offsets| offsets.get(tp))
            .copied()
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported(format!(
            "subscribing group '{}' to {:?} needs a group coordinator; pin a partition instead",
            self.settings.group_id, topics
        )))
    }

    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionInfo>, BrokerError> {
        self.ensure_open()?;
        let count = self.shared.fetch_partition_count(topic).await?;
        Ok((0..count)
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
            })
            .collect())
    }

    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut positions = BTreeMap::new();
        for tp in partitions {
            let position = match self.committed(tp) {
                Some(offset) => offset as i64,
                None => {
                    let client = self.shared.partition_client(&tp.topic, tp.partition).await?;
                    client
                        .get_offset(offset_at(self.settings.offset_reset))
                        .await
                        .map_err(|e| map_error(&tp.topic, e))?
                }
            };
            debug!("Consumer '{}' starts {} at {}", self.settings.client_id, tp, position);
            positions.insert(tp.clone(), position);
        }
        self.positions = positions;
        Ok(())
    }

    async fn seek(&mut self, partition: &TopicPartition, offset: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.positions.get_mut(partition) {
            Some(position) => {
                *position = offset as i64;
                Ok(())
            }
            None => Err(BrokerError::Rejected(format!(
                "partition {} is not assigned",
                partition
            ))),
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<ConsumerEvent, BrokerError> {
        self.ensure_open()?;
        if self.positions.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(ConsumerEvent::Records(Vec::new()));
        }

        let wait_ms = (timeout.as_millis() / self.positions.len() as u128).max(1) as i32;
        let mut records = Vec::new();
        let assigned: Vec<TopicPartition> = self.positions.keys().cloned().collect();
        for tp in assigned {
            if records.len() >= self.settings.max_poll_records {
                break;
            }
            let Some(position) = self.positions.get(&tp).copied() else {
                continue;
            };
            let client = self.shared.partition_client(&tp.topic, tp.partition).await?;
            let (fetched, _high_watermark) = client
                .fetch_records(position, 1..MAX_FETCH_BYTES, wait_ms)
                .await
                .map_err(|e| map_error(&tp.topic, e))?;

            let mut next = position;
            for record in fetched {
                if record.offset < position || records.len() >= self.settings.max_poll_records {
                    continue;
                }
                next = record.offset + 1;
                records.push(to_consumer_record(&tp.topic, tp.partition, record));
            }
            self.positions.insert(tp, next);
        }
        Ok(ConsumerEvent::Records(records))
    }

    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, u64>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut groups = self.shared.group_offsets.lock();
        let group = groups.entry(self.settings.group_id.clone()).or_default();
        for (tp, offset) in offsets {
            group.insert(tp.clone(), *offset);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.positions.clear();
    }
}

/// Producer handle over the broker's cached partition clients
pub struct KafkaProducer {
    shared: Arc<KafkaShared>,
    partitioner: Arc<Partitioner>,
    closed: AtomicBool,
}

impl KafkaProducer {
    /// Partition count that covers `partition`, refreshing a stale cache once
    async fn partition_count_for(
        &self,
        topic: &str,
        partition: Option<u32>,
    ) -> Result<u32, BrokerError> {
        let count = self.shared.partition_count(topic).await?;
        match partition {
            Some(partition) if partition >= count => {
                self.shared.fetch_partition_count(topic).await
            }
            _ => Ok(count),
        }
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let count = self
            .partition_count_for(&record.topic, record.partition)
            .await?;
        let partition = match record.partition {
            Some(partition) => partition,
            None => self
                .partitioner
                .partition(&record.topic, record.key.as_deref(), count),
        };
        if partition >= count {
            return Err(BrokerError::UnknownPartition {
                topic: record.topic,
                partition,
            });
        }

        let client = self.shared.partition_client(&record.topic, partition).await?;
        let timestamp = record.timestamp.unwrap_or_else(Utc::now);
        let headers: BTreeMap<String, Vec<u8>> = record
            .headers
            .into_iter()
            .map(|(name, value)| (name, value.to_vec()))
            .collect();
        let kafka_record = Record {
            key: record.key.map(|k| k.to_vec()),
            value: Some(record.value.to_vec()),
            headers,
            timestamp,
        };

        let offsets = match client
            .produce(vec![kafka_record], Compression::NoCompression)
            .await
        {
            Ok(offsets) => offsets,
            Err(e) => {
                let error = map_error(&record.topic, e);
                if error.is_unknown_topic() {
                    self.shared.forget_topic(&record.topic).await;
                }
                return Err(error);
            }
        };
        let offset = offsets
            .first()
            .copied()
            .ok_or_else(|| BrokerError::Rejected("broker returned no offset".to_string()))?;

        Ok(RecordMetadata {
            topic: record.topic,
            partition,
            offset: offset.max(0) as u64,
            timestamp,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
