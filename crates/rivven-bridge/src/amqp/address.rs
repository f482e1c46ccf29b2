//! AMQP address and filter parsing
//!
//! Consumer links use `<topic-path>/group.id/<group>`, producer links use
//! `<topic-path>`. Path separators in the topic part map to `.`.

use super::AmqpValue;
use crate::condition::ErrorCondition;
use crate::subscription::TopicSubscription;
use std::collections::BTreeMap;

/// Separator between topic and consumer group in a consumer address
pub const GROUP_ID_SEPARATOR: &str = "/group.id/";

/// Source filter selecting a partition
pub const PARTITION_FILTER: &str = "rivven:partition-filter:int";

/// Source filter selecting a start offset
pub const OFFSET_FILTER: &str = "rivven:offset-filter:long";

/// Map an AMQP address path to a topic name
pub fn topic_from_path(path: &str) -> String {
    path.replace('/', ".")
}

/// Topic and group of a consumer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerAddress {
    pub topic: String,
    pub group_id: String,
}

impl ConsumerAddress {
    pub fn parse(address: &str) -> Result<Self, ErrorCondition> {
        let Some(idx) = address.find(GROUP_ID_SEPARATOR) else {
            return Err(ErrorCondition::no_group_id());
        };
        if idx == 0 {
            return Err(ErrorCondition::empty_topic());
        }
        let group = &address[idx + GROUP_ID_SEPARATOR.len()..];
        if group.is_empty() {
            return Err(ErrorCondition::empty_group());
        }
        Ok(Self {
            topic: topic_from_path(&address[..idx]),
            group_id: group.to_string(),
        })
    }
}

/// Build the subscription described by a source terminus filter set
///
/// Checks run in a fixed order so a link with several problems always gets
/// the same condition: partition type, offset type, offset without
/// partition, then negative values.
pub fn parse_filters(
    topic: &str,
    filters: &BTreeMap<String, AmqpValue>,
) -> Result<TopicSubscription, ErrorCondition> {
    let partition = filters
        .get(PARTITION_FILTER)
        .map(|v| v.as_integer().ok_or_else(ErrorCondition::wrong_partition_filter))
        .transpose()?;
    let offset = filters
        .get(OFFSET_FILTER)
        .map(|v| v.as_integer().ok_or_else(ErrorCondition::wrong_offset_filter))
        .transpose()?;

    if offset.is_some() && partition.is_none() {
        return Err(ErrorCondition::no_partition_filter());
    }

    let partition = partition
        .map(|p| u32::try_from(p).map_err(|_| ErrorCondition::wrong_filter()))
        .transpose()?;
    let offset = offset
        .map(|o| u64::try_from(o).map_err(|_| ErrorCondition::wrong_filter()))
        .transpose()?;

    TopicSubscription::with_filters(topic, partition, offset)
}
