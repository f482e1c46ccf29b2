//! AMQP 1.0 side of the bridge
//!
//! The AMQP transport itself (framing, sessions, credit accounting on the
//! wire) lives outside this crate. It hands links to the bridge through the
//! [`SenderLink`] and [`ReceiverLink`] traits and forwards transport events
//! into the endpoints' mailboxes.
//!
//! ```text
//!  AMQP receiver ◀── SenderLink ◀── AmqpSinkEndpoint ◀── BrokerConsumer
//!  AMQP sender   ──▶ ReceiverLink ──▶ AmqpSourceEndpoint ──▶ BrokerProducer
//! ```

pub mod address;
pub mod bridge;
pub mod sink;
pub mod source;

pub use address::{ConsumerAddress, OFFSET_FILTER, PARTITION_FILTER};
pub use bridge::AmqpBridge;
pub use sink::{AmqpSinkEndpoint, SinkEvent, SinkState};
pub use source::{AmqpSourceEndpoint, AmqpSourceHandle, SourceEvent};

use crate::condition::ErrorCondition;
use crate::qos::SenderSettleMode;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Typed AMQP primitive used in filters and annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    UInt(u32),
    ULong(u64),
    String(String),
    Symbol(String),
    Binary(Bytes),
}

impl AmqpValue {
    /// Integer value regardless of width; `None` for non-integer types
    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(*v as i128),
            Self::Long(v) => Some(*v as i128),
            Self::UInt(v) => Some(*v as i128),
            Self::ULong(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

/// Source or target of a link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Terminus {
    pub address: Option<String>,
    /// Filter set (sources only)
    pub filters: BTreeMap<String, AmqpValue>,
}

impl Terminus {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: AmqpValue) -> Self {
        self.filters.insert(key.into(), value);
        self
    }
}

/// An AMQP message as seen by the bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    /// `to` property
    pub address: Option<String>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub message_annotations: BTreeMap<String, AmqpValue>,
    pub application_properties: BTreeMap<String, AmqpValue>,
    /// Body as a single data section
    pub body: Bytes,
}

impl AmqpMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: AmqpValue) -> Self {
        self.message_annotations.insert(key.into(), value);
        self
    }
}

/// Delivery tag, unique per link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(Bytes);

impl DeliveryTag {
    pub fn new(tag: impl Into<Bytes>) -> Self {
        Self(tag.into())
    }

    /// Tag of a broker record: `<partition>_<offset>`
    pub fn for_record(partition: u32, offset: u64) -> Self {
        Self(Bytes::from(format!("{}_{}", partition, offset)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// An inbound delivery awaiting its outcome
///
/// Not `Clone`: settling consumes the delivery, so it gets at most one outcome.
#[derive(Debug, PartialEq, Eq)]
pub struct Delivery {
    id: u64,
    tag: DeliveryTag,
    remotely_settled: bool,
}

impl Delivery {
    pub fn new(id: u64, tag: DeliveryTag, remotely_settled: bool) -> Self {
        Self {
            id,
            tag,
            remotely_settled,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    /// Sender already settled it, no disposition is expected
    pub fn is_remotely_settled(&self) -> bool {
        self.remotely_settled
    }
}

/// Terminal outcome of an inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected(ErrorCondition),
}

/// Outgoing link towards an AMQP receiver
pub trait SenderLink: Send {
    fn name(&self) -> &str;

    /// Source terminus requested by the peer
    fn remote_source(&self) -> Option<&Terminus>;

    /// Settle mode requested by the peer
    fn settle_mode(&self) -> SenderSettleMode;

    fn set_source(&mut self, source: Option<Terminus>);

    fn open(&mut self);

    fn is_open(&self) -> bool;

    /// Send a message; `settled` sends it pre-settled
    fn send(&mut self, tag: DeliveryTag, message: AmqpMessage, settled: bool);

    /// No credit or buffer left for further sends
    fn send_queue_full(&self) -> bool;

    /// Ask for a single [`SinkEvent::Drained`] once the send queue has room
    fn notify_when_drained(&mut self);

    /// Close the link, detaching with an error condition if given
    fn close(&mut self, error: Option<ErrorCondition>);
}

/// Incoming link from an AMQP sender
pub trait ReceiverLink: Send {
    fn name(&self) -> &str;

    /// Target terminus requested by the peer
    fn remote_target(&self) -> Option<&Terminus>;

    /// Settle mode requested by the peer
    fn settle_mode(&self) -> SenderSettleMode;

    fn set_target(&mut self, target: Option<Terminus>);

    /// Automatic acceptance of deliveries
    fn set_auto_accept(&mut self, auto_accept: bool);

    /// Credit the transport keeps topped up on its own; 0 disables it
    fn set_prefetch(&mut self, credit: u32);

    /// Grant additional credit
    fn flow(&mut self, credit: u32);

    fn open(&mut self);

    fn close(&mut self, error: Option<ErrorCondition>);

    /// Settle a delivery with its outcome
    fn disposition(&mut self, delivery: Delivery, outcome: Outcome);
}
