//! Bridge endpoint abstraction
//!
//! An endpoint owns one protocol-side resource (an AMQP link, a set of
//! receiver links, or one HTTP request) together with the broker client
//! serving it. Endpoints are driven by a single task; events from the
//! transport arrive through [`BridgeEndpoint::handle_event`].

use crate::error::Result;
use async_trait::async_trait;

/// Lifecycle shared by all bridge endpoints
#[async_trait]
pub trait BridgeEndpoint: Send {
    /// What starts the endpoint's work: a link attach or a request
    type Attach: Send;
    /// Result of handling an attach
    type Output: Send;
    /// Transport events delivered after attach
    type Event: Send;

    fn name(&self) -> &str;

    /// Acquire broker-side resources that exist for the endpoint's lifetime
    async fn open(&mut self) -> Result<()>;

    async fn handle(&mut self, attach: Self::Attach) -> Result<Self::Output>;

    async fn handle_event(&mut self, event: Self::Event);

    /// Release everything the endpoint owns; calling it again is a no-op
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Name and close bookkeeping embedded in every endpoint
#[derive(Debug)]
pub struct EndpointCore {
    name: String,
    closed: bool,
}

impl EndpointCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the endpoint closed; `true` only for the first call
    pub fn begin_close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }
}
