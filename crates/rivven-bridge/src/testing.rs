//! Testing utilities for bridge endpoints
//!
//! Mock AMQP links that record everything an endpoint does to them. The
//! mocks are cheap handles over shared state: hand one clone to the endpoint
//! and keep another to inspect it.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_bridge::testing::*;
//!
//! let link = MockSenderLink::new("receiver-1")
//!     .with_source(Terminus::new("orders/group.id/g1"));
//! sink.handle(Box::new(link.clone())).await?;
//! assert!(link.is_open());
//! ```

use crate::amqp::{
    AmqpMessage, Delivery, DeliveryTag, Outcome, ReceiverLink, SenderLink, Terminus,
};
use crate::condition::ErrorCondition;
use crate::qos::SenderSettleMode;
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// Mock Sender Link
// ============================================================================

/// A message the endpoint sent over a mock sender link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub tag: DeliveryTag,
    pub message: AmqpMessage,
    pub settled: bool,
}

#[derive(Debug, Default)]
struct SenderState {
    settle_mode: SenderSettleMode,
    source: Option<Terminus>,
    opened: bool,
    closed: bool,
    close_error: Option<ErrorCondition>,
    sent: Vec<SentMessage>,
    /// `None` means unlimited credit
    credit: Option<u32>,
    drain_requests: u32,
}

/// A mock outgoing link
#[derive(Debug, Clone)]
pub struct MockSenderLink {
    name: String,
    remote_source: Option<Terminus>,
    state: Arc<Mutex<SenderState>>,
}

impl MockSenderLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_source: None,
            state: Arc::new(Mutex::new(SenderState::default())),
        }
    }

    /// Source terminus the peer asks for
    pub fn with_source(mut self, source: Terminus) -> Self {
        self.remote_source = Some(source);
        self
    }

    pub fn with_settle_mode(self, mode: SenderSettleMode) -> Self {
        self.state.lock().settle_mode = mode;
        self
    }

    /// Limit how many messages fit before the send queue reports full
    pub fn with_credit(self, credit: u32) -> Self {
        self.state.lock().credit = Some(credit);
        self
    }

    pub fn grant_credit(&self, credit: u32) {
        let mut state = self.state.lock();
        let current = state.credit.unwrap_or(0);
        state.credit = Some(current + credit);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn local_source(&self) -> Option<Terminus> {
        self.state.lock().source.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Error condition the link was detached with
    pub fn close_error(&self) -> Option<ErrorCondition> {
        self.state.lock().close_error.clone()
    }

    pub fn drain_requests(&self) -> u32 {
        self.state.lock().drain_requests
    }
}

impl SenderLink for MockSenderLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn remote_source(&self) -> Option<&Terminus> {
        self.remote_source.as_ref()
    }

    fn settle_mode(&self) -> SenderSettleMode {
        self.state.lock().settle_mode
    }

    fn set_source(&mut self, source: Option<Terminus>) {
        self.state.lock().source = source;
    }

    fn open(&mut self) {
        self.state.lock().opened = true;
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.opened && !state.closed
    }

    fn send(&mut self, tag: DeliveryTag, message: AmqpMessage, settled: bool) {
        let mut state = self.state.lock();
        if let Some(credit) = state.credit.as_mut() {
            *credit = credit.saturating_sub(1);
        }
        state.sent.push(SentMessage {
            tag,
            message,
            settled,
        });
    }

    fn send_queue_full(&self) -> bool {
        self.state.lock().credit == Some(0)
    }

    fn notify_when_drained(&mut self) {
        self.state.lock().drain_requests += 1;
    }

    fn close(&mut self, error: Option<ErrorCondition>) {
        let mut state = self.state.lock();
        state.closed = true;
        if error.is_some() {
            state.close_error = error;
        }
    }
}

// ============================================================================
// Mock Receiver Link
// ============================================================================

#[derive(Debug, Default)]
struct ReceiverState {
    settle_mode: SenderSettleMode,
    target: Option<Terminus>,
    auto_accept: Option<bool>,
    prefetch: Option<u32>,
    flows: Vec<u32>,
    opened: bool,
    closed: bool,
    close_error: Option<ErrorCondition>,
    dispositions: Vec<(u64, Outcome)>,
}

/// A mock incoming link
#[derive(Debug, Clone)]
pub struct MockReceiverLink {
    name: String,
    remote_target: Option<Terminus>,
    state: Arc<Mutex<ReceiverState>>,
}

impl MockReceiverLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_target: None,
            state: Arc::new(Mutex::new(ReceiverState::default())),
        }
    }

    /// Target terminus the peer asks for
    pub fn with_target(mut self, target: Terminus) -> Self {
        self.remote_target = Some(target);
        self
    }

    pub fn with_settle_mode(self, mode: SenderSettleMode) -> Self {
        self.state.lock().settle_mode = mode;
        self
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.opened && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_error(&self) -> Option<ErrorCondition> {
        self.state.lock().close_error.clone()
    }

    pub fn local_target(&self) -> Option<Terminus> {
        self.state.lock().target.clone()
    }

    pub fn auto_accept(&self) -> Option<bool> {
        self.state.lock().auto_accept
    }

    pub fn prefetch(&self) -> Option<u32> {
        self.state.lock().prefetch
    }

    /// Credit grants in the order they were issued
    pub fn flows(&self) -> Vec<u32> {
        self.state.lock().flows.clone()
    }

    /// `(delivery id, outcome)` pairs in settlement order
    pub fn dispositions(&self) -> Vec<(u64, Outcome)> {
        self.state.lock().dispositions.clone()
    }
}

impl ReceiverLink for MockReceiverLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn remote_target(&self) -> Option<&Terminus> {
        self.remote_target.as_ref()
    }

    fn settle_mode(&self) -> SenderSettleMode {
        self.state.lock().settle_mode
    }

    fn set_target(&mut self, target: Option<Terminus>) {
        self.state.lock().target = target;
    }

    fn set_auto_accept(&mut self, auto_accept: bool) {
        self.state.lock().auto_accept = Some(auto_accept);
    }

    fn set_prefetch(&mut self, credit: u32) {
        self.state.lock().prefetch = Some(credit);
    }

    fn flow(&mut self, credit: u32) {
        self.state.lock().flows.push(credit);
    }

    fn open(&mut self) {
        self.state.lock().opened = true;
    }

    fn close(&mut self, error: Option<ErrorCondition>) {
        let mut state = self.state.lock();
        state.closed = true;
        if error.is_some() {
            state.close_error = error;
        }
    }

    fn disposition(&mut self, delivery: Delivery, outcome: Outcome) {
        self.state.lock().dispositions.push((delivery.id(), outcome));
    }
}

/// An unsettled delivery with a tag derived from its id
pub fn delivery(id: u64) -> Delivery {
    Delivery::new(id, DeliveryTag::new(id.to_string()), false)
}

/// A delivery the sender already settled
pub fn settled_delivery(id: u64) -> Delivery {
    Delivery::new(id, DeliveryTag::new(id.to_string()), true)
}
