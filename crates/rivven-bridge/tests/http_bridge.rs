//! Integration tests for the HTTP bridge router

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use rivven_bridge::broker::memory::{MemoryBroker, MemoryBrokerConfig};
use rivven_bridge::config::{BridgeConfig, EmbeddedFormat};
use rivven_bridge::HttpBridge;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

fn app(broker: &MemoryBroker, config: BridgeConfig) -> Router {
    HttpBridge::new(&config, Arc::new(broker.clone())).router()
}

async fn post(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_publish_returns_offsets_in_request_order() {
    let broker = MemoryBroker::default();
    broker.create_topic("orders", 2).unwrap();

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/orders",
        json!({"records": [
            {"value": {"id": 1}, "partition": 1},
            {"value": {"id": 2}, "partition": 0},
            {"value": {"id": 3}, "partition": 1}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"offsets": [
            {"partition": 1, "offset": 0},
            {"partition": 0, "offset": 0},
            {"partition": 1, "offset": 1}
        ]})
    );
    let stored = broker.records("orders", 1);
    assert_eq!(stored[1].value.as_ref(), br#"{"id":3}"#);
}

#[tokio::test]
async fn test_partition_path_overrides_records() {
    let broker = MemoryBroker::default();
    broker.create_topic("orders", 3).unwrap();

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/orders/partitions/2",
        json!({"records": [{"key": "k", "value": "v", "partition": 0}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"offsets": [{"partition": 2, "offset": 0}]}));
    assert_eq!(broker.end_offset("orders", 0), 0);
    assert_eq!(broker.records("orders", 2)[0].key.as_deref(), Some(&b"\"k\""[..]));
}

#[tokio::test]
async fn test_non_numeric_partition_is_unprocessable() {
    let broker = MemoryBroker::default();

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/orders/partitions/first",
        json!({"records": [{"value": 1}]}),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], 422);
    assert_eq!(body["message"], "Specified partition is not a valid number");
    assert_eq!(broker.partition_count("orders"), None);
}

#[tokio::test]
async fn test_malformed_body_is_unprocessable() {
    let broker = MemoryBroker::default();

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/orders",
        json!({"messages": []}),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], 422);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request body"));
}

#[tokio::test]
async fn test_failed_record_does_not_fail_batch() {
    let broker = MemoryBroker::default();
    broker.create_topic("orders", 1).unwrap();

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/orders",
        json!({"records": [
            {"value": "ok"},
            {"value": "bad", "partition": 9},
            {"value": "ok again"}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let offsets = body["offsets"].as_array().unwrap();
    assert_eq!(offsets[0], json!({"partition": 0, "offset": 0}));
    assert_eq!(offsets[1]["error_code"], 500);
    assert_eq!(offsets[2], json!({"partition": 0, "offset": 1}));
}

#[tokio::test]
async fn test_unknown_topic_reports_not_found() {
    let broker = MemoryBroker::new(MemoryBrokerConfig {
        auto_create_topics: false,
        default_partitions: 1,
    });

    let (status, body) = post(
        app(&broker, BridgeConfig::default()),
        "/topics/missing",
        json!({"records": [{"value": 1}, {"value": 2}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let offsets = body["offsets"].as_array().unwrap();
    assert_eq!(offsets.len(), 2);
    for offset in offsets {
        assert_eq!(offset["error_code"], 404);
        assert_eq!(offset["message"], "Topic missing not present in metadata");
    }
}

#[tokio::test]
async fn test_binary_format_decodes_base64() {
    let broker = MemoryBroker::default();
    let mut config = BridgeConfig::default();
    config.http.format = EmbeddedFormat::Binary;

    let (status, body) = post(
        app(&broker, config),
        "/topics/blobs",
        json!({"records": [{
            "key": "a2V5",
            "value": "aGVsbG8=",
            "headers": [{"key": "trace", "value": "YWJj"}]
        }]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"offsets": [{"partition": 0, "offset": 0}]}));
    let record = &broker.records("blobs", 0)[0];
    assert_eq!(record.key.as_deref(), Some(&b"key"[..]));
    assert_eq!(record.value.as_ref(), b"hello");
    assert_eq!(record.headers[0].0, "trace");
    assert_eq!(record.headers[0].1.as_ref(), b"abc");
}

#[tokio::test]
async fn test_body_limit() {
    let broker = MemoryBroker::default();
    let mut config = BridgeConfig::default();
    config.http.max_body_bytes = 16;

    let response = app(&broker, config)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/topics/orders")
                .body(Body::from(
                    json!({"records": [{"value": "far too long for the limit"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(broker.partition_count("orders"), None);
}
