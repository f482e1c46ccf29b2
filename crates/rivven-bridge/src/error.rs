//! Error types for rivven-bridge
//!
//! Endpoint operations return [`BridgeError`]; broker and converter
//! collaborators have their own error enums that convert into it.

use crate::broker::BrokerError;
use crate::condition::ErrorCondition;
use crate::converter::ConvertError;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for rivven-bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error reported to the AMQP peer
    #[error("Protocol error: {0}")]
    Protocol(ErrorCondition),

    /// Broker collaborator error
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Message conversion error
    #[error(transparent)]
    Conversion(#[from] ConvertError),

    /// Operation on an endpoint that is already closed
    #[error("Endpoint '{0}' is closed")]
    Closed(String),
}

impl BridgeError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The protocol condition carried by this error, if any
    pub fn condition(&self) -> Option<&ErrorCondition> {
        match self {
            Self::Protocol(condition) => Some(condition),
            _ => None,
        }
    }

    /// Check if this error was caused by an unknown topic
    pub fn is_unknown_topic(&self) -> bool {
        matches!(self, Self::Broker(e) if e.is_unknown_topic())
    }
}

impl From<ErrorCondition> for BridgeError {
    fn from(condition: ErrorCondition) -> Self {
        Self::Protocol(condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionCode;

    #[test]
    fn test_error_display() {
        let err = BridgeError::from(ErrorCondition::empty_group());
        assert_eq!(
            err.to_string(),
            "Protocol error: [rivven:empty-group] Empty consumer group in specified address"
        );
        assert_eq!(err.condition().map(|c| c.code), Some(ConditionCode::EmptyGroup));
    }

    #[test]
    fn test_unknown_topic_check() {
        let err = BridgeError::from(BrokerError::UnknownTopic("orders".to_string()));
        assert!(err.is_unknown_topic());
        assert!(!BridgeError::config("bad").is_unknown_topic());
    }
}
