//! Topic subscriptions requested by sink links

use crate::condition::ErrorCondition;
use std::fmt;

/// A topic, optionally pinned to a partition and a starting offset
///
/// An offset is only meaningful together with a partition, so the fallible
/// constructor refuses an offset without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSubscription {
    topic: String,
    partition: Option<u32>,
    offset: Option<u64>,
}

impl TopicSubscription {
    /// Subscription to a whole topic, partitions assigned by the consumer group
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
        }
    }

    /// Build a subscription from externally supplied filters
    pub fn with_filters(
        topic: impl Into<String>,
        partition: Option<u32>,
        offset: Option<u64>,
    ) -> Result<Self, ErrorCondition> {
        if offset.is_some() && partition.is_none() {
            return Err(ErrorCondition::no_partition_filter());
        }
        Ok(Self {
            topic: topic.into(),
            partition,
            offset,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_filter(&self) -> Option<u32> {
        self.partition
    }

    pub fn offset_filter(&self) -> Option<u64> {
        self.offset
    }

    /// Whether the partition is pinned instead of group-assigned
    pub fn is_manual(&self) -> bool {
        self.partition.is_some()
    }
}

impl fmt::Display for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        if let Some(partition) = self.partition {
            write!(f, "[{}]", partition)?;
        }
        if let Some(offset) = self.offset {
            write!(f, "@{}", offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionCode;

    #[test]
    fn test_offset_requires_partition() {
        let err = TopicSubscription::with_filters("orders", None, Some(5)).unwrap_err();
        assert_eq!(err.code, ConditionCode::NoPartitionFilter);

        let sub = TopicSubscription::with_filters("orders", Some(2), Some(5)).unwrap();
        assert_eq!(sub.partition_filter(), Some(2));
        assert_eq!(sub.offset_filter(), Some(5));
        assert!(sub.is_manual());
    }

    #[test]
    fn test_display() {
        assert_eq!(TopicSubscription::new("orders").to_string(), "orders");
        assert_eq!(
            TopicSubscription::with_filters("orders", Some(1), Some(10))
                .unwrap()
                .to_string(),
            "orders[1]@10"
        );
    }
}
