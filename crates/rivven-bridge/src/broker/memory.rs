//! In-process broker
//!
//! A partitioned append-only log with consumer-group offsets. Within a group a
//! partition is owned by at most one subscribed consumer; partitions freed by
//! a closing consumer are picked up by the next poll of another member.

use super::partitioner::Partitioner;
use super::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, ConsumerEvent, ConsumerRecord,
    ConsumerSettings, OffsetReset, PartitionInfo, ProducerRecord, RecordMetadata, TopicPartition,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Memory broker settings
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Create unknown topics on first use
    pub auto_create_topics: bool,
    /// Partition count of auto-created topics
    pub default_partitions: u32,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            auto_create_topics: true,
            default_partitions: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
    headers: Vec<(String, Bytes)>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// group -> partition -> next offset to read
    committed: HashMap<String, HashMap<TopicPartition, u64>>,
    /// group -> partition -> owning member
    owners: HashMap<String, HashMap<TopicPartition, u64>>,
}

impl LogState {
    fn ensure_topic(&mut self, topic: &str, config: &MemoryBrokerConfig) -> Result<u32, BrokerError> {
        if let Some(partitions) = self.topics.get(topic) {
            return Ok(partitions.len() as u32);
        }
        if !config.auto_create_topics {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        let count = config.default_partitions.max(1);
        debug!("Auto-creating topic '{}' with {} partitions", topic, count);
        self.topics
            .insert(topic.to_string(), vec![Vec::new(); count as usize]);
        Ok(count)
    }

    fn start_position(&self, group: &str, tp: &TopicPartition, reset: OffsetReset) -> u64 {
        if let Some(offset) = self.committed.get(group).and_then(|g| g.get(tp)) {
            return *offset;
        }
        match reset {
            OffsetReset::Earliest => 0,
            OffsetReset::Latest => self.end_offset(tp),
        }
    }

    fn end_offset(&self, tp: &TopicPartition) -> u64 {
        self.topics
            .get(&tp.topic)
            .and_then(|p| p.get(tp.partition as usize))
            .map(|log| log.len() as u64)
            .unwrap_or(0)
    }
}

struct Shared {
    config: MemoryBrokerConfig,
    state: Mutex<LogState>,
    appended: Notify,
    partitioner: Partitioner,
    next_member: AtomicU64,
    consumers_created: AtomicU64,
    open_consumers: AtomicUsize,
}

/// In-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
                partitioner: Partitioner::new(),
                next_member: AtomicU64::new(1),
                consumers_created: AtomicU64::new(0),
                open_consumers: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a topic with a fixed number of partitions
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::Rejected(
                "topic needs at least one partition".to_string(),
            ));
        }
        let mut state = self.shared.state.lock();
        if state.topics.contains_key(topic) {
            return Err(BrokerError::Rejected(format!(
                "topic {} already exists",
                topic
            )));
        }
        state
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions as usize]);
        Ok(())
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|p| p.len() as u32)
    }

    /// Committed next-to-read offset of a group
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.shared
            .state
            .lock()
            .committed
            .get(group)
            .and_then(|g| g.get(&TopicPartition::new(topic, partition)))
            .copied()
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        self.shared
            .state
            .lock()
            .end_offset(&TopicPartition::new(topic, partition))
    }

    /// Snapshot of the records stored in a partition
    pub fn records(&self, topic: &str, partition: u32) -> Vec<ConsumerRecord> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, r)| to_consumer_record(topic, partition, offset as u64, r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Consumers created since the broker started
    pub fn consumers_created(&self) -> u64 {
        self.shared.consumers_created.load(Ordering::Relaxed)
    }

    /// Consumers created and not yet closed
    pub fn open_consumers(&self) -> usize {
        self.shared.open_consumers.load(Ordering::Relaxed)
    }
}

impl BrokerClient for MemoryBroker {
    fn create_consumer(
        &self,
        settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.shared.consumers_created.fetch_add(1, Ordering::Relaxed);
        self.shared.open_consumers.fetch_add(1, Ordering::Relaxed);
        let member_id = self.shared.next_member.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Created consumer {} (member {}) in group '{}'",
            settings.client_id, member_id, settings.group_id
        );
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            member_id,
            settings,
            subscription: Vec::new(),
            assignment: Vec::new(),
            positions: HashMap::new(),
            pending: VecDeque::new(),
            closed: false,
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

fn to_consumer_record(topic: &str, partition: u32, offset: u64, r: &StoredRecord) -> ConsumerRecord {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: r.key.clone(),
        value: r.value.clone(),
        headers: r.headers.clone(),
        timestamp: r.timestamp,
    }
}

/// Consumer of the in-process broker
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    member_id: u64,
    settings: ConsumerSettings,
    subscription: Vec<String>,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, u64>,
    pending: VecDeque<ConsumerEvent>,
    closed: bool,
}

impl MemoryConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Take every unowned partition of the subscribed topics
    fn claim_free(&mut self, state: &mut LogState) -> Vec<TopicPartition> {
        let group = self.settings.group_id.clone();
        let mut claimed = Vec::new();
        for topic in &self.subscription {
            let count = state.topics.get(topic).map(|p| p.len() as u32).unwrap_or(0);
            for partition in 0..count {
                let tp = TopicPartition::new(topic.clone(), partition);
                let owners = state.owners.entry(group.clone()).or_default();
                if owners.contains_key(&tp) {
                    continue;
                }
                owners.insert(tp.clone(), self.member_id);
                claimed.push(tp);
            }
        }
        for tp in &claimed {
            let position = state.start_position(&group, tp, self.settings.offset_reset);
            self.positions.insert(tp.clone(), position);
        }
        self.assignment.extend(claimed.iter().cloned());
        claimed
    }

    fn fetch(&mut self, state: &LogState) -> Vec<ConsumerRecord> {
        let mut records = Vec::new();
        for tp in &self.assignment {
            let remaining = self.settings.max_poll_records.saturating_sub(records.len());
            if remaining == 0 {
                break;
            }
            let Some(log) = state
                .topics
                .get(&tp.topic)
                .and_then(|p| p.get(tp.partition as usize))
            else {
                continue;
            };
            let position = self.positions.get(tp).copied().unwrap_or(0);
            let start = position as usize;
            if start >= log.len() {
                continue;
            }
            let end = (start + remaining).min(log.len());
            for (i, stored) in log[start..end].iter().enumerate() {
                records.push(to_consumer_record(
                    &tp.topic,
                    tp.partition,
                    (start + i) as u64,
                    stored,
                ));
            }
            self.positions.insert(tp.clone(), end as u64);
        }
        records
    }

    fn release(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(owners) = state.owners.get_mut(&self.settings.group_id) {
            owners.retain(|_, member| *member != self.member_id);
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        for topic in topics {
            state.ensure_topic(topic, &shared.config)?;
        }
        self.subscription = topics.to_vec();
        let claimed = self.claim_free(&mut state);
        self.pending.push_back(ConsumerEvent::PartitionsAssigned(claimed));
        Ok(())
    }

    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionInfo>, BrokerError> {
        self.ensure_open()?;
        let count = self
            .shared
            .state
            .lock()
            .ensure_topic(topic, &self.shared.config)?;
        Ok((0..count)
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
            })
            .collect())
    }

    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        for tp in partitions {
            let count = state.ensure_topic(&tp.topic, &shared.config)?;
            if tp.partition >= count {
                return Err(BrokerError::UnknownPartition {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                });
            }
        }
        self.assignment = partitions.to_vec();
        self.positions.clear();
        for tp in partitions {
            let position =
                state.start_position(&self.settings.group_id, tp, self.settings.offset_reset);
            self.positions.insert(tp.clone(), position);
        }
        Ok(())
    }

    async fn seek(&mut self, partition: &TopicPartition, offset: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !self.assignment.contains(partition) {
            return Err(BrokerError::Rejected(format!(
                "partition {} is not assigned",
                partition
            )));
        }
        self.positions.insert(partition.clone(), offset);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<ConsumerEvent, BrokerError> {
        self.ensure_open()?;
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + timeout;
        loop {
            let notified = shared.appended.notified();
            {
                let mut state = shared.state.lock();
                if !self.subscription.is_empty() {
                    let claimed = self.claim_free(&mut state);
                    if !claimed.is_empty() {
                        return Ok(ConsumerEvent::PartitionsAssigned(claimed));
                    }
                }
                let records = self.fetch(&state);
                if !records.is_empty() {
                    return Ok(ConsumerEvent::Records(records));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ConsumerEvent::Records(Vec::new()));
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn commit(
        &mut self,
        offsets: &BTreeMap<TopicPartition, u64>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let group = state
            .committed
            .entry(self.settings.group_id.clone())
            .or_default();
        for (tp, offset) in offsets {
            group.insert(tp.clone(), *offset);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release();
        self.shared.open_consumers.fetch_sub(1, Ordering::Relaxed);
        // wake other members so they can claim the released partitions
        self.shared.appended.notify_waiters();
        debug!(
            "Closed consumer {} in group '{}'",
            self.settings.client_id, self.settings.group_id
        );
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
            self.shared.open_consumers.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Producer of the in-process broker
pub struct MemoryProducer {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let timestamp = record.timestamp.unwrap_or_else(Utc::now);
        let metadata = {
            let mut state = self.shared.state.lock();
            let count = state.ensure_topic(&record.topic, &self.shared.config)?;
            let partition = match record.partition {
                Some(partition) => partition,
                None => self
                    .shared
                    .partitioner
                    .partition(&record.topic, record.key.as_deref(), count),
            };
            if partition >= count {
                return Err(BrokerError::UnknownPartition {
                    topic: record.topic,
                    partition,
                });
            }
            let log = state
                .topics
                .get_mut(&record.topic)
                .and_then(|p| p.get_mut(partition as usize))
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
            let offset = log.len() as u64;
            log.push(StoredRecord {
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp,
            });
            RecordMetadata {
                topic: record.topic,
                partition,
                offset,
                timestamp,
            }
        };
        self.shared.appended.notify_waiters();
        Ok(metadata)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(group: &str) -> ConsumerSettings {
        ConsumerSettings {
            group_id: group.to_string(),
            client_id: format!("{}-client", group),
            max_poll_records: 100,
            offset_reset: OffsetReset::Earliest,
        }
    }

    async fn poll_records(consumer: &mut Box<dyn BrokerConsumer>) -> Vec<ConsumerRecord> {
        match consumer.poll(Duration::from_millis(50)).await.unwrap() {
            ConsumerEvent::Records(records) => records,
            other => panic!("expected records, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_produce_assigns_offsets_per_partition() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 2).unwrap();
        let producer = broker.create_producer().unwrap();

        let a = producer
            .send(ProducerRecord::new("orders", "a").with_partition(1))
            .await
            .unwrap();
        let b = producer
            .send(ProducerRecord::new("orders", "b").with_partition(1))
            .await
            .unwrap();
        assert_eq!((a.partition, a.offset), (1, 0));
        assert_eq!((b.partition, b.offset), (1, 1));
        assert_eq!(broker.end_offset("orders", 0), 0);
        assert_eq!(broker.records("orders", 1)[1].value, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_unknown_topic_without_auto_create() {
        let broker = MemoryBroker::new(MemoryBrokerConfig {
            auto_create_topics: false,
            default_partitions: 1,
        });
        let producer = broker.create_producer().unwrap();
        let err = producer
            .send(ProducerRecord::new("missing", "v"))
            .await
            .unwrap_err();
        assert!(err.is_unknown_topic());
    }

    #[tokio::test]
    async fn test_partition_out_of_range() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let producer = broker.create_producer().unwrap();
        let err = producer
            .send(ProducerRecord::new("orders", "v").with_partition(4))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownPartition { partition: 4, .. }));
    }

    #[tokio::test]
    async fn test_group_members_get_exclusive_partitions() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();

        let mut first = broker.create_consumer(settings("g")).unwrap();
        first.subscribe(&["orders".to_string()]).await.unwrap();
        assert_eq!(
            first.poll(Duration::from_millis(10)).await.unwrap(),
            ConsumerEvent::PartitionsAssigned(vec![TopicPartition::new("orders", 0)])
        );

        let mut second = broker.create_consumer(settings("g")).unwrap();
        second.subscribe(&["orders".to_string()]).await.unwrap();
        assert_eq!(
            second.poll(Duration::from_millis(10)).await.unwrap(),
            ConsumerEvent::PartitionsAssigned(vec![])
        );

        // the partition moves once the owner leaves
        first.close().await;
        assert_eq!(
            second.poll(Duration::from_millis(10)).await.unwrap(),
            ConsumerEvent::PartitionsAssigned(vec![TopicPartition::new("orders", 0)])
        );
        assert_eq!(broker.open_consumers(), 1);
    }

    #[tokio::test]
    async fn test_assign_seek_and_commit() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let producer = broker.create_producer().unwrap();
        for i in 0..5 {
            producer
                .send(ProducerRecord::new("orders", format!("v{}", i)))
                .await
                .unwrap();
        }

        let tp = TopicPartition::new("orders", 0);
        let mut consumer = broker.create_consumer(settings("g")).unwrap();
        consumer.assign(&[tp.clone()]).await.unwrap();
        consumer.seek(&tp, 3).await.unwrap();

        let records = poll_records(&mut consumer).await;
        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let offsets = BTreeMap::from([(tp.clone(), 5)]);
        consumer.commit(&offsets).await.unwrap();
        assert_eq!(broker.committed_offset("g", "orders", 0), Some(5));

        // a new member of the group resumes from the committed offset
        let mut next = broker.create_consumer(settings("g")).unwrap();
        next.assign(&[tp]).await.unwrap();
        assert!(poll_records(&mut next).await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let producer = broker.create_producer().unwrap();
        producer.send(ProducerRecord::new("orders", "old")).await.unwrap();

        let tp = TopicPartition::new("orders", 0);
        let mut consumer = broker
            .create_consumer(ConsumerSettings {
                offset_reset: OffsetReset::Latest,
                ..settings("fresh")
            })
            .unwrap();
        consumer.assign(&[tp]).await.unwrap();
        producer.send(ProducerRecord::new("orders", "new")).await.unwrap();

        let records = poll_records(&mut consumer).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 1);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let mut consumer = broker.create_consumer(settings("g")).unwrap();
        consumer
            .assign(&[TopicPartition::new("orders", 0)])
            .await
            .unwrap();

        let producer = broker.create_producer().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(ProducerRecord::new("orders", "late")).await
        });

        let event = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(event, ConsumerEvent::Records(ref r) if r.len() == 1));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_sends() {
        let broker = MemoryBroker::default();
        let producer = broker.create_producer().unwrap();
        producer.close().await;
        assert_eq!(
            producer.send(ProducerRecord::new("t", "v")).await,
            Err(BrokerError::Closed)
        );
    }
}
