//! # rivven-bridge
//!
//! Protocol bridge that lets AMQP 1.0 peers and HTTP clients produce to and
//! consume from a partitioned log broker.
//!
//! ```text
//! ┌──────────────┐   SenderLink    ┌──────────────────┐  BrokerConsumer  ┌──────────┐
//! │ AMQP receiver│◀────────────────│ AmqpSinkEndpoint │◀─────────────────│          │
//! └──────────────┘                 └──────────────────┘                  │          │
//! ┌──────────────┐  ReceiverLink   ┌──────────────────┐  BrokerProducer  │  Broker  │
//! │ AMQP sender  │────────────────▶│AmqpSourceEndpoint│─────────────────▶│          │
//! └──────────────┘                 └──────────────────┘                  │          │
//! ┌──────────────┐   POST /topics  ┌──────────────────┐  BrokerProducer  │          │
//! │ HTTP client  │────────────────▶│HttpSourceEndpoint│─────────────────▶│          │
//! └──────────────┘                 └──────────────────┘                  └──────────┘
//! ```
//!
//! Each endpoint is driven by a single task. Transport callbacks arrive as
//! events in the endpoint's mailbox, so endpoint state is never shared.
//!
//! ## Delivery guarantees
//!
//! - Sender settle mode `settled` maps to at-most-once: records are sent
//!   pre-settled and never tracked.
//! - Sender settle mode `unsettled` maps to at-least-once: an offset is
//!   committed only once every earlier record of its partition was settled
//!   by the receiver, see [`OffsetTracker`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_bridge::{broker, BridgeConfig, HttpBridge};
//!
//! let config = BridgeConfig::from_file("bridge.yaml")?;
//! let broker = broker::connect(&config.broker).await?;
//! HttpBridge::new(&config, broker)
//!     .run("0.0.0.0:8080".parse()?, async { let _ = tokio::signal::ctrl_c().await; })
//!     .await?;
//! ```

pub mod amqp;
pub mod broker;
pub mod condition;
pub mod config;
pub mod converter;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod qos;
pub mod subscription;
pub mod testing;
pub mod tracker;

pub use amqp::{AmqpBridge, AmqpSinkEndpoint, AmqpSourceEndpoint, AmqpSourceHandle};
pub use broker::{BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, SharedBrokerClient};
pub use condition::{ConditionCode, ErrorCondition};
pub use config::BridgeConfig;
pub use endpoint::BridgeEndpoint;
pub use error::{BridgeError, Result};
pub use http::{HttpBridge, HttpSourceEndpoint};
pub use qos::{QoS, SenderSettleMode};
pub use subscription::TopicSubscription;
pub use tracker::OffsetTracker;
