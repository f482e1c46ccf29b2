//! Integration tests for the AMQP source endpoint

use rivven_bridge::amqp::{
    AmqpBridge, AmqpMessage, AmqpSourceEndpoint, Outcome, SourceEvent, Terminus,
};
use rivven_bridge::broker::memory::{MemoryBroker, MemoryBrokerConfig};
use rivven_bridge::condition::ConditionCode;
use rivven_bridge::config::{AmqpConfig, AmqpConverterKind, BridgeConfig};
use rivven_bridge::converter::amqp_converter;
use rivven_bridge::qos::SenderSettleMode;
use rivven_bridge::testing::{delivery, settled_delivery, MockReceiverLink};
use rivven_bridge::BridgeEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn source_with(
    broker: &MemoryBroker,
    config: AmqpConfig,
    converter: AmqpConverterKind,
) -> AmqpSourceEndpoint {
    AmqpSourceEndpoint::new(
        "source-test",
        config,
        Arc::new(broker.clone()),
        amqp_converter(converter),
    )
}

fn source(broker: &MemoryBroker) -> AmqpSourceEndpoint {
    source_with(broker, AmqpConfig::default(), AmqpConverterKind::Default)
}

fn receiver(name: &str, address: &str) -> MockReceiverLink {
    MockReceiverLink::new(name).with_target(Terminus::new(address))
}

async fn deliver(endpoint: &mut AmqpSourceEndpoint, link: &str, id: u64, body: &str) {
    endpoint
        .handle_event(SourceEvent::Delivery {
            link: link.to_string(),
            delivery: delivery(id),
            message: AmqpMessage::new(body.to_string()),
        })
        .await;
}

async fn wait_for_records(broker: &MemoryBroker, topic: &str, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.end_offset(topic, 0) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unsettled_link_gets_manual_credit() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "orders");

    endpoint.handle(Box::new(link.clone())).await.unwrap();

    assert!(link.is_open());
    assert_eq!(link.auto_accept(), Some(false));
    assert_eq!(link.prefetch(), Some(0));
    assert_eq!(link.flows(), vec![1024]);
    assert_eq!(
        link.local_target().and_then(|t| t.address),
        Some("orders".to_string())
    );
}

#[tokio::test]
async fn test_settled_link_gets_prefetch() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "orders").with_settle_mode(SenderSettleMode::Settled);

    endpoint.handle(Box::new(link.clone())).await.unwrap();

    assert_eq!(link.prefetch(), Some(1024));
    assert!(link.flows().is_empty());
}

#[tokio::test]
async fn test_accepted_after_broker_ack() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "sensors/temperature");
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    deliver(&mut endpoint, "sender-1", 7, "21.5").await;
    assert!(endpoint.complete_next_send().await);

    assert_eq!(link.dispositions(), vec![(7, Outcome::Accepted)]);
    let records = broker.records("sensors.temperature", 0);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value.as_ref(), b"21.5");
    assert_eq!(endpoint.stats().accepted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sends_keep_arrival_order() {
    const COUNT: u64 = 2000;
    let broker = MemoryBroker::default();
    broker.create_topic("orders", 1).unwrap();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "orders");
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    for id in 0..COUNT {
        deliver(&mut endpoint, "sender-1", id, &id.to_string()).await;
    }
    for _ in 0..COUNT {
        assert!(endpoint.complete_next_send().await);
    }

    let stored: Vec<u64> = broker
        .records("orders", 0)
        .iter()
        .map(|r| std::str::from_utf8(&r.value).unwrap().parse().unwrap())
        .collect();
    assert_eq!(stored, (0..COUNT).collect::<Vec<_>>());
    let settled: Vec<u64> = link.dispositions().iter().map(|(id, _)| *id).collect();
    assert_eq!(settled, (0..COUNT).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_rejected_when_broker_refuses() {
    let broker = MemoryBroker::new(MemoryBrokerConfig {
        auto_create_topics: false,
        default_partitions: 1,
    });
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "missing");
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    deliver(&mut endpoint, "sender-1", 1, "payload").await;
    assert!(endpoint.complete_next_send().await);

    let dispositions = link.dispositions();
    assert_eq!(dispositions.len(), 1);
    match &dispositions[0].1 {
        Outcome::Rejected(condition) => {
            assert_eq!(condition.code, ConditionCode::SendToBroker);
            assert!(condition.description.contains("missing"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(endpoint.stats().rejected, 1);
}

#[tokio::test]
async fn test_presettled_delivery_gets_no_disposition() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "orders").with_settle_mode(SenderSettleMode::Settled);
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    endpoint
        .handle_event(SourceEvent::Delivery {
            link: "sender-1".to_string(),
            delivery: settled_delivery(1),
            message: AmqpMessage::new("fire"),
        })
        .await;

    wait_for_records(&broker, "orders", 1).await;
    assert!(link.dispositions().is_empty());
    assert_eq!(endpoint.stats().fire_and_forget, 1);
}

#[tokio::test]
async fn test_credit_returned_in_increments() {
    let broker = MemoryBroker::default();
    let config = AmqpConfig {
        flow_credit: 4,
        credit_increment: 2,
        ..AmqpConfig::default()
    };
    let mut endpoint = source_with(&broker, config, AmqpConverterKind::Default);
    let link = receiver("sender-1", "orders");
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    deliver(&mut endpoint, "sender-1", 1, "a").await;
    assert!(endpoint.complete_next_send().await);
    assert_eq!(link.flows(), vec![4]);

    deliver(&mut endpoint, "sender-1", 2, "b").await;
    assert!(endpoint.complete_next_send().await);
    assert_eq!(link.flows(), vec![4, 2]);
}

#[tokio::test]
async fn test_unconvertible_message_is_rejected() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    // no target address: each message must carry its own `to`
    let link = MockReceiverLink::new("router");
    endpoint.handle(Box::new(link.clone())).await.unwrap();
    assert!(link.is_open());

    deliver(&mut endpoint, "router", 1, "no destination").await;

    let dispositions = link.dispositions();
    assert_eq!(dispositions.len(), 1);
    assert!(matches!(
        &dispositions[0].1,
        Outcome::Rejected(c) if c.code == ConditionCode::MessageConversion
    ));

    endpoint
        .handle_event(SourceEvent::Delivery {
            link: "router".to_string(),
            delivery: delivery(2),
            message: AmqpMessage::new("routed").with_address("audit/log"),
        })
        .await;
    assert!(endpoint.complete_next_send().await);
    assert_eq!(broker.records("audit.log", 0).len(), 1);
}

#[tokio::test]
async fn test_missing_target_without_routing_closes_endpoint() {
    let broker = MemoryBroker::default();
    let mut endpoint = source_with(&broker, AmqpConfig::default(), AmqpConverterKind::Raw);
    let link = MockReceiverLink::new("sender-1");

    let err = endpoint.handle(Box::new(link.clone())).await.unwrap_err();

    assert_eq!(
        err.condition().map(|c| c.code),
        Some(ConditionCode::NoTargetAddress)
    );
    assert_eq!(
        link.close_error().map(|c| c.code),
        Some(ConditionCode::NoTargetAddress)
    );
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn test_links_share_endpoint_until_last_closes() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let first = receiver("a", "orders");
    let second = receiver("b", "payments");
    endpoint.handle(Box::new(first.clone())).await.unwrap();
    endpoint.handle(Box::new(second.clone())).await.unwrap();

    let (reply, rx) = oneshot::channel();
    endpoint.handle_event(SourceEvent::Links(reply)).await;
    assert_eq!(rx.await.unwrap(), vec!["a".to_string(), "b".to_string()]);

    endpoint
        .handle_event(SourceEvent::RemoteClosed {
            link: "a".to_string(),
        })
        .await;
    assert!(first.is_closed());
    assert!(!endpoint.is_closed());
    assert_eq!(endpoint.link_names(), vec!["b".to_string()]);

    endpoint
        .handle_event(SourceEvent::RemoteDetached {
            link: "b".to_string(),
        })
        .await;
    assert!(second.is_closed());
    assert!(endpoint.is_closed());

    // queries are still answered after close
    let (reply, rx) = oneshot::channel();
    endpoint.handle_event(SourceEvent::Links(reply)).await;
    assert!(rx.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_link_name_is_refused() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let first = receiver("a", "orders");
    let duplicate = receiver("a", "payments");
    endpoint.handle(Box::new(first.clone())).await.unwrap();

    let err = endpoint.handle(Box::new(duplicate.clone())).await.unwrap_err();

    assert_eq!(
        err.condition().map(|c| c.code),
        Some(ConditionCode::DuplicateLink)
    );
    assert!(first.is_open());
    assert!(duplicate.is_closed());
    assert!(!endpoint.is_closed());
}

#[tokio::test]
async fn test_completion_after_close_is_ignored() {
    let broker = MemoryBroker::default();
    let mut endpoint = source(&broker);
    let link = receiver("sender-1", "orders");
    endpoint.handle(Box::new(link.clone())).await.unwrap();

    deliver(&mut endpoint, "sender-1", 1, "late").await;
    endpoint.close().await;
    endpoint.close().await;

    assert!(endpoint.complete_next_send().await);
    assert!(link.dispositions().is_empty());
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_bridge_routes_receivers_by_connection() {
    let broker = MemoryBroker::default();
    let bridge = AmqpBridge::new(&BridgeConfig::default(), Arc::new(broker.clone()));
    let first = receiver("a", "orders");
    let second = receiver("b", "orders");

    let handle = bridge
        .attach_receiver("conn-1", Box::new(first.clone()))
        .await
        .unwrap();
    let same = bridge
        .attach_receiver("conn-1", Box::new(second.clone()))
        .await
        .unwrap();
    assert_eq!(handle.name(), same.name());
    assert_eq!(bridge.source_count().await, 1);

    let links = handle.links().await.unwrap();
    assert_eq!(links, vec!["a".to_string(), "b".to_string()]);

    handle
        .deliver("a", delivery(1), AmqpMessage::new("via bridge"))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.dispositions().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(first.dispositions(), vec![(1, Outcome::Accepted)]);

    bridge.connection_closed("conn-1").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(bridge.source_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attaches_share_one_source() {
    let broker = MemoryBroker::default();
    let bridge = Arc::new(AmqpBridge::new(
        &BridgeConfig::default(),
        Arc::new(broker.clone()),
    ));

    let attaches: Vec<_> = (0..16)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let link = receiver(&format!("link-{}", i), "orders");
                bridge
                    .attach_receiver("conn-1", Box::new(link))
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut handles = Vec::new();
    for attach in attaches {
        handles.push(attach.await.unwrap());
    }

    assert!(handles.iter().all(|h| h.name() == handles[0].name()));
    assert_eq!(bridge.source_count().await, 1);
    assert_eq!(handles[0].links().await.unwrap().len(), 16);
}
