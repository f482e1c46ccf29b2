//! Quality-of-service mapping between AMQP settle modes and delivery guarantees

use crate::condition::{ConditionCode, ErrorCondition};
use std::fmt;

/// AMQP sender settle mode negotiated on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled and wait for the peer's settlement
    #[default]
    Unsettled,
    /// Deliveries are pre-settled by the sender
    Settled,
    /// The sender decides per delivery
    Mixed,
}

/// Delivery guarantee of a bridged link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire-and-forget, pre-settled
    AtMostOnce,
    /// Unsettled until the peer confirms
    AtLeastOnce,
}

impl TryFrom<SenderSettleMode> for QoS {
    type Error = ErrorCondition;

    fn try_from(mode: SenderSettleMode) -> Result<Self, Self::Error> {
        match mode {
            SenderSettleMode::Settled => Ok(Self::AtMostOnce),
            SenderSettleMode::Unsettled => Ok(Self::AtLeastOnce),
            SenderSettleMode::Mixed => Err(ErrorCondition::new(
                ConditionCode::UnsupportedQos,
                "Mixed settle mode is not supported",
            )),
        }
    }
}

impl From<QoS> for SenderSettleMode {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::Settled,
            QoS::AtLeastOnce => Self::Unsettled,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtMostOnce => write!(f, "at-most-once"),
            Self::AtLeastOnce => write!(f, "at-least-once"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_mode_mapping() {
        assert_eq!(QoS::try_from(SenderSettleMode::Settled), Ok(QoS::AtMostOnce));
        assert_eq!(
            QoS::try_from(SenderSettleMode::Unsettled),
            Ok(QoS::AtLeastOnce)
        );
        assert_eq!(SenderSettleMode::from(QoS::AtMostOnce), SenderSettleMode::Settled);
    }

    #[test]
    fn test_mixed_is_rejected() {
        let err = QoS::try_from(SenderSettleMode::Mixed).unwrap_err();
        assert_eq!(err.code, ConditionCode::UnsupportedQos);
    }
}
