//! Message converters
//!
//! Converters translate between protocol payloads and broker records. They
//! are pure functions of their input and hold no per-link state.

pub mod amqp;
pub mod http;

pub use self::amqp::{DefaultAmqpConverter, RawAmqpConverter};
pub use self::http::{BinaryHttpConverter, JsonHttpConverter};

use crate::amqp::AmqpMessage;
use crate::broker::{ConsumerRecord, ProducerRecord};
use crate::config::{AmqpConverterKind, EmbeddedFormat};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while decoding a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// Payload is not in the expected format
    #[error("{0}")]
    InvalidPayload(String),

    /// Message does not say which topic it belongs to
    #[error("No topic for message: {0}")]
    NoTopic(String),
}

impl ConvertError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

/// Converts between AMQP messages and broker records
pub trait AmqpMessageConverter: Send + Sync {
    /// Build a producer record from an inbound message
    ///
    /// `topic` is the link's target topic; `None` when the link has no target
    /// address and the message itself must name its destination.
    fn to_record(
        &self,
        topic: Option<&str>,
        message: &AmqpMessage,
    ) -> Result<ProducerRecord, ConvertError>;

    /// Build an outbound message from a consumed record
    fn to_message(&self, address: &str, record: &ConsumerRecord) -> AmqpMessage;

    /// Whether messages can carry their own destination topic
    fn supports_message_routing(&self) -> bool {
        false
    }
}

/// Decodes HTTP publish bodies into broker records
pub trait HttpMessageConverter: Send + Sync {
    /// `partition` from the request path overrides per-record partitions
    fn to_records(
        &self,
        topic: &str,
        partition: Option<u32>,
        body: &[u8],
    ) -> Result<Vec<ProducerRecord>, ConvertError>;
}

/// Converter configured for AMQP links
pub fn amqp_converter(kind: AmqpConverterKind) -> Arc<dyn AmqpMessageConverter> {
    match kind {
        AmqpConverterKind::Default => Arc::new(DefaultAmqpConverter),
        AmqpConverterKind::Raw => Arc::new(RawAmqpConverter),
    }
}

/// Converter for an HTTP payload format
pub fn http_converter(format: EmbeddedFormat) -> Arc<dyn HttpMessageConverter> {
    match format {
        EmbeddedFormat::Json => Arc::new(JsonHttpConverter),
        EmbeddedFormat::Binary => Arc::new(BinaryHttpConverter),
    }
}
