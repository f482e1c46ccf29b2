//! Offset tracking for at-least-once delivery
//!
//! The tracker remembers, per partition, which offsets were sent to the peer
//! and not yet settled. The offset that is safe to commit for a partition is
//! the lowest offset still in flight, or one past the highest delivered offset
//! once nothing is in flight. Committed offsets never move backwards.

use crate::broker::ConsumerRecord;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<u64>,
    highest_delivered: Option<u64>,
    committed: Option<u64>,
}

impl PartitionOffsets {
    fn candidate(&self) -> Option<u64> {
        let next = match self.in_flight.first() {
            Some(lowest) => Some(*lowest),
            None => self.highest_delivered.map(|o| o + 1),
        };
        match (next, self.committed) {
            (Some(next), Some(committed)) => Some(next.max(committed)),
            (next, committed) => next.or(committed),
        }
    }
}

/// In-flight and delivered offsets of one topic
#[derive(Debug)]
pub struct OffsetTracker {
    topic: String,
    partitions: BTreeMap<u32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record a consumer record as sent and awaiting settlement
    pub fn track(&mut self, record: &ConsumerRecord) {
        debug_assert_eq!(record.topic, self.topic, "record from a foreign topic");
        self.partitions
            .entry(record.partition)
            .or_default()
            .in_flight
            .insert(record.offset);
    }

    /// Mark a tracked offset as confirmed by the peer
    ///
    /// Returns `false` when the offset was never tracked. That is a caller bug:
    /// debug builds panic, release builds log it and leave the state untouched.
    pub fn delivered(&mut self, partition: u32, offset: u64) -> bool {
        let tracked = self
            .partitions
            .get_mut(&partition)
            .map(|p| p.in_flight.remove(&offset))
            .unwrap_or(false);

        debug_assert!(
            tracked,
            "offset {} of {}[{}] delivered before being tracked",
            offset, self.topic, partition
        );
        if !tracked {
            warn!(
                "Offset {} of {}[{}] delivered before being tracked, ignoring",
                offset, self.topic, partition
            );
            return false;
        }

        if let Some(state) = self.partitions.get_mut(&partition) {
            state.highest_delivered = Some(match state.highest_delivered {
                Some(highest) => highest.max(offset),
                None => offset,
            });
        }
        true
    }

    /// Next offset to commit per partition
    ///
    /// Partitions with nothing tracked or delivered are omitted.
    pub fn commit_offsets(&mut self) -> BTreeMap<u32, u64> {
        let mut offsets = BTreeMap::new();
        for (partition, state) in self.partitions.iter_mut() {
            if let Some(next) = state.candidate() {
                state.committed = Some(next);
                offsets.insert(*partition, next);
            }
        }
        offsets
    }

    /// Forget a partition, e.g. after it was revoked from this consumer
    pub fn remove_partition(&mut self, partition: u32) {
        self.partitions.remove(&partition);
    }

    /// Drop all tracked state
    pub fn clear(&mut self) {
        self.partitions.clear();
    }

    pub fn is_in_flight(&self, partition: u32, offset: u64) -> bool {
        self.partitions
            .get(&partition)
            .is_some_and(|p| p.in_flight.contains(&offset))
    }

    /// Number of offsets awaiting settlement across all partitions
    pub fn in_flight_count(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }

    pub fn highest_delivered(&self, partition: u32) -> Option<u64> {
        self.partitions
            .get(&partition)
            .and_then(|p| p.highest_delivered)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
