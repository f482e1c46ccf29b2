//! HTTP source endpoint
//!
//! One endpoint serves one publish request: decode the body into records,
//! send them all with a bounded number in flight, and answer with one offset
//! entry per record in request order.

use crate::broker::{BrokerError, BrokerProducer, RecordMetadata, SharedBrokerClient};
use crate::config::HttpConfig;
use crate::converter::HttpMessageConverter;
use crate::endpoint::{BridgeEndpoint, EndpointCore};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_NAME_PREFIX: &str = "rivven-bridge-producer";

/// A publish request as extracted from the HTTP layer
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    /// Raw partition path segment, validated by the endpoint
    pub partition: Option<String>,
    pub body: Bytes,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            body: body.into(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }
}

/// Outcome for a single record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OffsetResult {
    Stored { partition: u32, offset: u64 },
    Failed { error_code: u16, message: String },
}

impl From<RecordMetadata> for OffsetResult {
    fn from(meta: RecordMetadata) -> Self {
        OffsetResult::Stored {
            partition: meta.partition,
            offset: meta.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffsetsResponse {
    pub offsets: Vec<OffsetResult>,
}

/// Request-level error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error_code: u16,
    pub message: String,
}

/// Response to a publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResponse {
    Offsets(OffsetsResponse),
    Error(ErrorResponse),
}

impl PublishResponse {
    fn unprocessable(message: impl Into<String>) -> Self {
        PublishResponse::Error(ErrorResponse {
            error_code: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            message: message.into(),
        })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PublishResponse::Offsets(_) => StatusCode::OK,
            PublishResponse::Error(e) => {
                StatusCode::from_u16(e.error_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for PublishResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            PublishResponse::Offsets(body) => (status, Json(body)).into_response(),
            PublishResponse::Error(body) => (status, Json(body)).into_response(),
        }
    }
}

/// Status code reported for a record the broker refused
fn record_error_code(error: &BrokerError) -> u16 {
    if error.is_unknown_topic() {
        StatusCode::NOT_FOUND.as_u16()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.as_u16()
    }
}

/// Producer endpoint for a single HTTP publish request
pub struct HttpSourceEndpoint {
    core: EndpointCore,
    config: HttpConfig,
    broker: SharedBrokerClient,
    converter: Arc<dyn HttpMessageConverter>,
    producer: Option<Arc<dyn BrokerProducer>>,
    /// Set when a send failure means the producer should not be reused; the
    /// endpoint refuses further requests and waits for its owner to close it
    closing: bool,
}

impl HttpSourceEndpoint {
    pub fn new(
        bridge_id: Option<&str>,
        config: HttpConfig,
        broker: SharedBrokerClient,
        converter: Arc<dyn HttpMessageConverter>,
    ) -> Self {
        let name = format!(
            "{}-{}",
            bridge_id.unwrap_or(DEFAULT_NAME_PREFIX),
            Uuid::new_v4()
        );
        Self {
            core: EndpointCore::new(name),
            config,
            broker,
            converter,
            producer: None,
            closing: false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    async fn publish(
        &mut self,
        producer: Arc<dyn BrokerProducer>,
        request: PublishRequest,
    ) -> PublishResponse {
        let partition = match request.partition.as_deref() {
            None => None,
            Some(raw) => match raw.parse::<u32>() {
                Ok(partition) => Some(partition),
                Err(_) => {
                    return PublishResponse::unprocessable(
                        "Specified partition is not a valid number",
                    )
                }
            },
        };

        let records = match self
            .converter
            .to_records(&request.topic, partition, &request.body)
        {
            Ok(records) => records,
            Err(e) => {
                debug!("Endpoint '{}' rejected body: {}", self.core.name(), e);
                return PublishResponse::unprocessable(e.to_string());
            }
        };

        let count = records.len();
        let results: Vec<std::result::Result<RecordMetadata, BrokerError>> = stream::iter(records)
            .map(|record| {
                let producer = Arc::clone(&producer);
                async move { producer.send(record).await }
            })
            .buffered(self.config.max_in_flight_sends.max(1))
            .collect()
            .await;

        let mut offsets = Vec::with_capacity(count);
        for result in results {
            match result {
                Ok(meta) => offsets.push(OffsetResult::from(meta)),
                Err(e) => {
                    if e.is_unknown_topic() {
                        self.closing = true;
                    }
                    warn!(
                        "Endpoint '{}' failed to send to '{}': {}",
                        self.core.name(),
                        request.topic,
                        e
                    );
                    offsets.push(OffsetResult::Failed {
                        error_code: record_error_code(&e),
                        message: e.to_string(),
                    });
                }
            }
        }

        debug!(
            "Endpoint '{}' published {} records to '{}'",
            self.core.name(),
            count,
            request.topic
        );
        PublishResponse::Offsets(OffsetsResponse { offsets })
    }
}

#[async_trait]
impl BridgeEndpoint for HttpSourceEndpoint {
    type Attach = PublishRequest;
    type Output = PublishResponse;
    type Event = Infallible;

    fn name(&self) -> &str {
        self.core.name()
    }

    async fn open(&mut self) -> Result<()> {
        if self.core.is_closed() {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        }
        if self.producer.is_none() {
            self.producer = Some(self.broker.create_producer()?);
        }
        Ok(())
    }

    async fn handle(&mut self, request: PublishRequest) -> Result<PublishResponse> {
        if self.closing {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        }
        self.open().await?;
        let Some(producer) = self.producer.clone() else {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        };
        Ok(self.publish(producer, request).await)
    }

    async fn handle_event(&mut self, event: Infallible) {
        match event {}
    }

    async fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        if let Some(producer) = self.producer.take() {
            producer.close().await;
        }
        info!("Endpoint '{}' closed", self.core.name());
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryBrokerConfig};
    use crate::converter::JsonHttpConverter;

    fn endpoint(broker: &MemoryBroker) -> HttpSourceEndpoint {
        HttpSourceEndpoint::new(
            Some("bridge-test"),
            HttpConfig::default(),
            Arc::new(broker.clone()),
            Arc::new(JsonHttpConverter),
        )
    }

    #[test]
    fn test_name_uses_bridge_id() {
        let broker = MemoryBroker::default();
        let endpoint = endpoint(&broker);
        assert!(endpoint.name().starts_with("bridge-test-"));

        let anonymous = HttpSourceEndpoint::new(
            None,
            HttpConfig::default(),
            Arc::new(broker),
            Arc::new(JsonHttpConverter),
        );
        assert!(anonymous.name().starts_with("rivven-bridge-producer-"));
        assert_ne!(endpoint.name(), anonymous.name());
    }

    #[tokio::test]
    async fn test_invalid_partition() {
        let broker = MemoryBroker::default();
        let mut endpoint = endpoint(&broker);
        let request =
            PublishRequest::new("orders", r#"{"records":[{"value":1}]}"#).with_partition("abc");

        let response = endpoint.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response,
            PublishResponse::unprocessable("Specified partition is not a valid number")
        );
        assert_eq!(broker.end_offset("orders", 0), 0);
    }

    #[tokio::test]
    async fn test_offsets_in_order() {
        let broker = MemoryBroker::default();
        let mut endpoint = endpoint(&broker);
        let request = PublishRequest::new(
            "orders",
            r#"{"records":[{"value":"a"},{"value":"b"},{"value":"c"}]}"#,
        );

        let response = endpoint.handle(request).await.unwrap();
        let PublishResponse::Offsets(body) = response else {
            panic!("expected offsets");
        };
        let offsets: Vec<_> = body
            .offsets
            .iter()
            .map(|o| match o {
                OffsetResult::Stored { offset, .. } => *offset,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_topic_flags_endpoint_for_close() {
        let broker = MemoryBroker::new(MemoryBrokerConfig {
            auto_create_topics: false,
            default_partitions: 1,
        });
        let mut endpoint = endpoint(&broker);

        let response = endpoint
            .handle(PublishRequest::new("missing", r#"{"records":[{"value":1}]}"#))
            .await
            .unwrap();
        let PublishResponse::Offsets(body) = response else {
            panic!("expected offsets");
        };
        assert!(matches!(
            body.offsets[0],
            OffsetResult::Failed { error_code: 404, .. }
        ));
        assert!(endpoint.is_closing());
        assert!(!endpoint.is_closed());

        let retry = endpoint
            .handle(PublishRequest::new("missing", r#"{"records":[{"value":2}]}"#))
            .await;
        assert!(matches!(retry, Err(BridgeError::Closed(_))));

        endpoint.close().await;
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::default();
        let mut endpoint = endpoint(&broker);
        endpoint
            .handle(PublishRequest::new("orders", r#"{"records":[{"value":1}]}"#))
            .await
            .unwrap();

        endpoint.close().await;
        endpoint.close().await;

        assert!(endpoint.is_closed());
        let after = endpoint
            .handle(PublishRequest::new("orders", r#"{"records":[{"value":2}]}"#))
            .await;
        assert!(matches!(after, Err(BridgeError::Closed(_))));
        assert_eq!(broker.end_offset("orders", 0), 1);
    }

    #[test]
    fn test_offset_result_json() {
        let stored = serde_json::to_value(OffsetResult::Stored {
            partition: 1,
            offset: 7,
        })
        .unwrap();
        assert_eq!(stored, serde_json::json!({"partition": 1, "offset": 7}));

        let failed = serde_json::to_value(OffsetResult::Failed {
            error_code: 500,
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(failed, serde_json::json!({"error_code": 500, "message": "boom"}));
    }
}
