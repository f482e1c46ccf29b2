//! Error-condition vocabulary shared by the AMQP endpoints
//!
//! Every condition carries a stable symbolic code (sent to the peer on link
//! detach or in a rejected outcome) and a human-readable description.

use std::fmt;

/// Symbolic error codes reported to AMQP peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    /// Consumer address without the `/group.id/` separator
    NoGroupId,
    /// Consumer address with nothing before the separator
    EmptyTopic,
    /// Consumer address with nothing after the separator
    EmptyGroup,
    /// Partition filter that is not an integer
    WrongPartitionFilter,
    /// Offset filter that is not an integer
    WrongOffsetFilter,
    /// Offset filter given without a partition filter
    NoPartitionFilter,
    /// Negative partition or offset filter
    WrongFilter,
    /// Group assignment left this member without partitions
    NoPartitions,
    /// Requested partition is not part of the topic
    PartitionNotExists,
    /// Subscribe, assign, seek or partition lookup failed
    BrokerSubscribe,
    /// Offset commit failed
    BrokerCommit,
    /// Polling the broker failed repeatedly
    BrokerConsume,
    /// The broker refused or failed to store a record
    SendToBroker,
    /// An AMQP message could not be turned into a broker record
    MessageConversion,
    /// The link requested a settle mode the endpoint cannot honour
    UnsupportedQos,
    /// Receiver link without a target address and no per-message routing
    NoTargetAddress,
    /// A link with the same name is already attached to the endpoint
    DuplicateLink,
}

impl ConditionCode {
    /// The wire symbol for this code
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NoGroupId => "rivven:no-group-id",
            Self::EmptyTopic => "rivven:empty-topic",
            Self::EmptyGroup => "rivven:empty-group",
            Self::WrongPartitionFilter => "rivven:wrong-partition-filter",
            Self::WrongOffsetFilter => "rivven:wrong-offset-filter",
            Self::NoPartitionFilter => "rivven:no-partition-filter",
            Self::WrongFilter => "rivven:wrong-filter",
            Self::NoPartitions => "rivven:no-free-partitions",
            Self::PartitionNotExists => "rivven:partition-not-exists",
            Self::BrokerSubscribe => "rivven:broker-subscribe",
            Self::BrokerCommit => "rivven:broker-commit",
            Self::BrokerConsume => "rivven:broker-consume",
            Self::SendToBroker => "rivven:send-to-broker",
            Self::MessageConversion => "rivven:message-conversion",
            Self::UnsupportedQos => "rivven:unsupported-qos",
            Self::NoTargetAddress => "rivven:no-target-address",
            Self::DuplicateLink => "rivven:duplicate-link",
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// An error condition attached to a link detach or a rejected delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    pub code: ConditionCode,
    pub description: String,
}

impl ErrorCondition {
    pub fn new(code: ConditionCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn no_group_id() -> Self {
        Self::new(
            ConditionCode::NoGroupId,
            "Mandatory group.id not specified in the address",
        )
    }

    pub fn empty_topic() -> Self {
        Self::new(ConditionCode::EmptyTopic, "Empty topic in specified address")
    }

    pub fn empty_group() -> Self {
        Self::new(
            ConditionCode::EmptyGroup,
            "Empty consumer group in specified address",
        )
    }

    pub fn wrong_partition_filter() -> Self {
        Self::new(ConditionCode::WrongPartitionFilter, "Wrong partition filter")
    }

    pub fn wrong_offset_filter() -> Self {
        Self::new(ConditionCode::WrongOffsetFilter, "Wrong offset filter")
    }

    pub fn no_partition_filter() -> Self {
        Self::new(ConditionCode::NoPartitionFilter, "No partition filter specified")
    }

    pub fn wrong_filter() -> Self {
        Self::new(ConditionCode::WrongFilter, "Wrong filter")
    }

    pub fn no_partitions() -> Self {
        Self::new(
            ConditionCode::NoPartitions,
            "All partitions already have a receiver",
        )
    }

    pub fn partition_not_exists() -> Self {
        Self::new(
            ConditionCode::PartitionNotExists,
            "Specified partition doesn't exist",
        )
    }

    /// Subscribe-family failure with the cause appended
    pub fn broker_subscribe(context: &str, cause: impl fmt::Display) -> Self {
        Self::new(ConditionCode::BrokerSubscribe, format!("{}: {}", context, cause))
    }

    pub fn broker_commit(cause: impl fmt::Display) -> Self {
        Self::new(ConditionCode::BrokerCommit, format!("Error in commit: {}", cause))
    }

    pub fn broker_consume(cause: impl fmt::Display) -> Self {
        Self::new(ConditionCode::BrokerConsume, format!("Error polling: {}", cause))
    }

    /// Rejected outcome for a failed broker send, carrying the failure message
    pub fn send_to_broker(cause: impl fmt::Display) -> Self {
        Self::new(ConditionCode::SendToBroker, cause.to_string())
    }

    pub fn message_conversion(cause: impl fmt::Display) -> Self {
        Self::new(ConditionCode::MessageConversion, cause.to_string())
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.description)
    }
}

impl std::error::Error for ErrorCondition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            ErrorCondition::no_group_id(),
            ErrorCondition::empty_topic(),
            ErrorCondition::empty_group(),
            ErrorCondition::wrong_partition_filter(),
            ErrorCondition::wrong_offset_filter(),
            ErrorCondition::no_partition_filter(),
            ErrorCondition::wrong_filter(),
            ErrorCondition::no_partitions(),
            ErrorCondition::partition_not_exists(),
            ErrorCondition::broker_commit("boom"),
            ErrorCondition::send_to_broker("boom"),
        ];
        let symbols: std::collections::HashSet<_> =
            all.iter().map(|c| c.code.symbol()).collect();
        assert_eq!(symbols.len(), all.len());
    }

    #[test]
    fn test_subscribe_condition_appends_cause() {
        let cond = ErrorCondition::broker_subscribe("Error subscribing to orders", "timed out");
        assert_eq!(cond.code, ConditionCode::BrokerSubscribe);
        assert_eq!(cond.description, "Error subscribing to orders: timed out");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ErrorCondition::wrong_filter().to_string(),
            "[rivven:wrong-filter] Wrong filter"
        );
    }
}
