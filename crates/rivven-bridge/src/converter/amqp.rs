//! AMQP message converters

use super::{AmqpMessageConverter, ConvertError};
use crate::amqp::address::topic_from_path;
use crate::amqp::{AmqpMessage, AmqpValue};
use crate::broker::{ConsumerRecord, ProducerRecord};
use bytes::Bytes;

/// Annotation carrying the record's topic
pub const TOPIC_ANNOTATION: &str = "x-opt-bridge.topic";
/// Annotation carrying the record's partition
pub const PARTITION_ANNOTATION: &str = "x-opt-bridge.partition";
/// Annotation carrying the record's offset
pub const OFFSET_ANNOTATION: &str = "x-opt-bridge.offset";
/// Annotation carrying the record's key
pub const KEY_ANNOTATION: &str = "x-opt-bridge.key";

/// Body plus bridge annotations
///
/// Inbound messages may name a partition and key through annotations; links
/// without a target address route each message by its `to` address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAmqpConverter;

impl AmqpMessageConverter for DefaultAmqpConverter {
    fn to_record(
        &self,
        topic: Option<&str>,
        message: &AmqpMessage,
    ) -> Result<ProducerRecord, ConvertError> {
        let topic = match (topic, message.address.as_deref()) {
            (Some(topic), _) => topic.to_string(),
            (None, Some(address)) if !address.is_empty() => topic_from_path(address),
            _ => {
                return Err(ConvertError::NoTopic(
                    message.message_id.clone().unwrap_or_default(),
                ))
            }
        };

        let mut record = ProducerRecord::new(topic, message.body.clone());

        if let Some(value) = message.message_annotations.get(PARTITION_ANNOTATION) {
            let partition = value
                .as_integer()
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| ConvertError::invalid("partition annotation must be a non-negative integer"))?;
            record.partition = Some(partition);
        }

        record.key = match message.message_annotations.get(KEY_ANNOTATION) {
            Some(AmqpValue::Binary(key)) => Some(key.clone()),
            Some(value) => match value.as_str() {
                Some(key) => Some(Bytes::copy_from_slice(key.as_bytes())),
                None => return Err(ConvertError::invalid("key annotation must be a string or binary")),
            },
            None => None,
        };

        for (name, value) in &message.application_properties {
            match value {
                AmqpValue::Binary(bytes) => record.headers.push((name.clone(), bytes.clone())),
                other => {
                    if let Some(s) = other.as_str() {
                        record
                            .headers
                            .push((name.clone(), Bytes::copy_from_slice(s.as_bytes())));
                    }
                }
            }
        }

        Ok(record)
    }

    fn to_message(&self, address: &str, record: &ConsumerRecord) -> AmqpMessage {
        let mut message = AmqpMessage::new(record.value.clone())
            .with_address(address)
            .with_annotation(TOPIC_ANNOTATION, AmqpValue::String(record.topic.clone()))
            .with_annotation(
                PARTITION_ANNOTATION,
                i32::try_from(record.partition)
                    .map(AmqpValue::Int)
                    .unwrap_or(AmqpValue::UInt(record.partition)),
            )
            .with_annotation(
                OFFSET_ANNOTATION,
                i64::try_from(record.offset)
                    .map(AmqpValue::Long)
                    .unwrap_or(AmqpValue::ULong(record.offset)),
            );
        if let Some(key) = &record.key {
            message
                .message_annotations
                .insert(KEY_ANNOTATION.to_string(), AmqpValue::Binary(key.clone()));
        }
        for (name, value) in &record.headers {
            message
                .application_properties
                .insert(name.clone(), AmqpValue::Binary(value.clone()));
        }
        message
    }

    fn supports_message_routing(&self) -> bool {
        true
    }
}

/// Body only, no annotations and no per-message routing
#[derive(Debug, Clone, Copy, Default)]
pub struct RawAmqpConverter;

impl AmqpMessageConverter for RawAmqpConverter {
    fn to_record(
        &self,
        topic: Option<&str>,
        message: &AmqpMessage,
    ) -> Result<ProducerRecord, ConvertError> {
        let topic = topic.ok_or_else(|| {
            ConvertError::NoTopic(message.message_id.clone().unwrap_or_default())
        })?;
        Ok(ProducerRecord::new(topic, message.body.clone()))
    }

    fn to_message(&self, address: &str, record: &ConsumerRecord) -> AmqpMessage {
        AmqpMessage::new(record.value.clone()).with_address(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_record() -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".to_string(),
            partition: 2,
            offset: 17,
            key: Some(Bytes::from_static(b"customer-1")),
            value: Bytes::from_static(b"{\"total\":10}"),
            headers: vec![("trace".to_string(), Bytes::from_static(b"abc"))],
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_outbound_annotations() {
        let message = DefaultAmqpConverter.to_message("orders/group.id/g", &consumer_record());
        assert_eq!(message.address.as_deref(), Some("orders/group.id/g"));
        assert_eq!(
            message.message_annotations.get(PARTITION_ANNOTATION),
            Some(&AmqpValue::Int(2))
        );
        assert_eq!(
            message.message_annotations.get(OFFSET_ANNOTATION),
            Some(&AmqpValue::Long(17))
        );
        assert_eq!(
            message.message_annotations.get(KEY_ANNOTATION),
            Some(&AmqpValue::Binary(Bytes::from_static(b"customer-1")))
        );
        assert_eq!(message.body, Bytes::from_static(b"{\"total\":10}"));
    }

    #[test]
    fn test_inbound_uses_link_topic_and_annotations() {
        let message = AmqpMessage::new("payload")
            .with_address("ignored/address")
            .with_annotation(PARTITION_ANNOTATION, AmqpValue::Int(1))
            .with_annotation(KEY_ANNOTATION, AmqpValue::String("k1".into()));

        let record = DefaultAmqpConverter
            .to_record(Some("orders"), &message)
            .unwrap();
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, Some(1));
        assert_eq!(record.key, Some(Bytes::from_static(b"k1")));
    }

    #[test]
    fn test_inbound_routes_by_message_address() {
        let message = AmqpMessage::new("payload").with_address("sensors/humidity");
        let record = DefaultAmqpConverter.to_record(None, &message).unwrap();
        assert_eq!(record.topic, "sensors.humidity");

        let err = DefaultAmqpConverter
            .to_record(None, &AmqpMessage::new("payload"))
            .unwrap_err();
        assert!(matches!(err, ConvertError::NoTopic(_)));
    }

    #[test]
    fn test_negative_partition_annotation() {
        let message =
            AmqpMessage::new("payload").with_annotation(PARTITION_ANNOTATION, AmqpValue::Int(-3));
        assert!(DefaultAmqpConverter.to_record(Some("orders"), &message).is_err());
    }

    #[test]
    fn test_raw_converter() {
        assert!(!RawAmqpConverter.supports_message_routing());
        let message = RawAmqpConverter.to_message("addr", &consumer_record());
        assert!(message.message_annotations.is_empty());

        let record = RawAmqpConverter
            .to_record(Some("orders"), &AmqpMessage::new("x"))
            .unwrap();
        assert_eq!(record.value, Bytes::from_static(b"x"));
        assert!(RawAmqpConverter.to_record(None, &AmqpMessage::new("x")).is_err());
    }
}
