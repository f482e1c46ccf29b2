//! HTTP bridge
//!
//! Publishes JSON-enveloped records to broker topics.

pub mod server;
pub mod source;

pub use server::{HttpBridge, HttpState};
pub use source::{
    ErrorResponse, HttpSourceEndpoint, OffsetResult, OffsetsResponse, PublishRequest,
    PublishResponse,
};
