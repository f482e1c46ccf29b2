//! Source endpoint - receives AMQP messages, produces them to the broker
//!
//! One endpoint serves every receiver link of a connection and shares one
//! broker producer between them. Converted records are queued to a single
//! sender task that awaits each send before starting the next, so records
//! reach the broker in arrival order. Completions come back through a channel
//! and are applied by the endpoint task, which is the only code touching the
//! links. On close the sender task drains its queue, then closes the producer.
//!
//! Credit:
//! - pre-settled links get a standing prefetch of `flow_credit`
//! - other links start with `flow_credit` and get `credit_increment` back
//!   each time that many messages were handled

use super::address::topic_from_path;
use super::{AmqpMessage, Delivery, Outcome, ReceiverLink};
use crate::broker::{
    BrokerError, BrokerProducer, ProducerRecord, RecordMetadata, SharedBrokerClient,
};
use crate::condition::{ConditionCode, ErrorCondition};
use crate::config::AmqpConfig;
use crate::converter::AmqpMessageConverter;
use crate::endpoint::{BridgeEndpoint, EndpointCore};
use crate::error::{BridgeError, Result};
use crate::qos::SenderSettleMode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Transport events for a source endpoint
pub enum SourceEvent {
    /// A new receiver link was attached by the peer
    Attach(Box<dyn ReceiverLink>),
    /// A message arrived on a link
    Delivery {
        link: String,
        delivery: Delivery,
        message: AmqpMessage,
    },
    /// The peer closed a link
    RemoteClosed { link: String },
    /// The peer detached a link
    RemoteDetached { link: String },
    /// Names of the links currently served
    Links(oneshot::Sender<Vec<String>>),
}

/// Record queued for the sender task
struct SendJob {
    link: String,
    /// `None` for remotely settled deliveries, which get no outcome
    delivery: Option<Delivery>,
    record: ProducerRecord,
}

/// Outcome of a broker send for an unsettled delivery
struct SendCompletion {
    link: String,
    delivery: Delivery,
    result: std::result::Result<RecordMetadata, BrokerError>,
}

struct ManagedReceiver {
    link: Box<dyn ReceiverLink>,
    topic: Option<String>,
    /// Credit is granted by the endpoint instead of the transport's prefetch
    manual_credit: bool,
    handled: u32,
}

impl ManagedReceiver {
    fn release_credit(&mut self, increment: u32) {
        if !self.manual_credit {
            return;
        }
        self.handled += 1;
        if self.handled >= increment {
            self.link.flow(self.handled);
            self.handled = 0;
        }
    }
}

/// Counters of a source endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub deliveries: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Remotely settled messages handed to the broker without an outcome
    pub fire_and_forget: u64,
}

/// Bridges AMQP receiver links to a broker producer
pub struct AmqpSourceEndpoint {
    core: EndpointCore,
    config: AmqpConfig,
    broker: SharedBrokerClient,
    converter: Arc<dyn AmqpMessageConverter>,
    sends: Option<mpsc::UnboundedSender<SendJob>>,
    receivers: HashMap<String, ManagedReceiver>,
    stats: SourceStats,
    events_tx: mpsc::UnboundedSender<SourceEvent>,
    events_rx: mpsc::UnboundedReceiver<SourceEvent>,
    completions_tx: mpsc::UnboundedSender<SendCompletion>,
    completions_rx: mpsc::UnboundedReceiver<SendCompletion>,
}

impl AmqpSourceEndpoint {
    pub fn new(
        name: impl Into<String>,
        config: AmqpConfig,
        broker: SharedBrokerClient,
        converter: Arc<dyn AmqpMessageConverter>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            core: EndpointCore::new(name),
            config,
            broker,
            converter,
            sends: None,
            receivers: HashMap::new(),
            stats: SourceStats::default(),
            events_tx,
            events_rx,
            completions_tx,
            completions_rx,
        }
    }

    /// Handle for posting transport events to this endpoint
    pub fn source_handle(&self) -> AmqpSourceHandle {
        AmqpSourceHandle {
            name: self.core.name().to_string(),
            tx: self.events_tx.clone(),
        }
    }

    /// Names of the attached receiver links, sorted
    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.receivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Drive the endpoint until it closes
    pub async fn run(mut self) {
        debug!("Source '{}' task started", self.core.name());
        while !self.core.is_closed() {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(done) = self.completions_rx.recv() => self.complete_send(done),
                else => break,
            }
        }
    }

    /// Wait for the next broker send to finish and settle its delivery
    ///
    /// Returns `false` if no completion can arrive anymore.
    pub async fn complete_next_send(&mut self) -> bool {
        match self.completions_rx.recv().await {
            Some(done) => {
                self.complete_send(done);
                true
            }
            None => false,
        }
    }

    fn reject_attach(
        &self,
        mut link: Box<dyn ReceiverLink>,
        condition: ErrorCondition,
    ) -> BridgeError {
        warn!(
            "Source '{}' rejecting link '{}': {}",
            self.core.name(),
            link.name(),
            condition
        );
        link.close(Some(condition.clone()));
        BridgeError::Protocol(condition)
    }

    async fn attach(&mut self, mut link: Box<dyn ReceiverLink>) -> Result<()> {
        let name = link.name().to_string();
        if self.receivers.contains_key(&name) {
            let condition = ErrorCondition::new(
                ConditionCode::DuplicateLink,
                format!("Link '{}' is already attached", name),
            );
            return Err(self.reject_attach(link, condition));
        }

        let target = link.remote_target().cloned();
        let topic = match target.as_ref().and_then(|t| t.address.as_deref()) {
            Some(address) if !address.is_empty() => Some(topic_from_path(address)),
            _ if self.converter.supports_message_routing() => None,
            _ => {
                let condition = ErrorCondition::new(
                    ConditionCode::NoTargetAddress,
                    "Link has no target address and messages cannot name their topic",
                );
                return Err(self.reject_attach(link, condition));
            }
        };

        link.set_target(target);
        link.set_auto_accept(false);
        let manual_credit = link.settle_mode() != SenderSettleMode::Settled;
        if manual_credit {
            link.set_prefetch(0);
            link.flow(self.config.flow_credit);
        } else {
            link.set_prefetch(self.config.flow_credit);
        }
        link.open();

        info!(
            "Source '{}' attached link '{}' to topic {}",
            self.core.name(),
            name,
            topic.as_deref().unwrap_or("<per message>")
        );
        self.receivers.insert(
            name,
            ManagedReceiver {
                link,
                topic,
                manual_credit,
                handled: 0,
            },
        );
        Ok(())
    }

    fn handle_delivery(&mut self, link: String, delivery: Delivery, message: AmqpMessage) {
        let increment = self.config.credit_increment;
        let Some(receiver) = self.receivers.get_mut(&link) else {
            warn!(
                "Source '{}' delivery on unknown link '{}'",
                self.core.name(),
                link
            );
            return;
        };
        self.stats.deliveries += 1;

        let record = match self.converter.to_record(receiver.topic.as_deref(), &message) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Source '{}' cannot convert message on '{}': {}",
                    self.core.name(),
                    link,
                    e
                );
                if !delivery.is_remotely_settled() {
                    receiver.link.disposition(
                        delivery,
                        Outcome::Rejected(ErrorCondition::message_conversion(e)),
                    );
                    self.stats.rejected += 1;
                }
                receiver.release_credit(increment);
                return;
            }
        };

        let settled = delivery.is_remotely_settled();
        let job = SendJob {
            link,
            delivery: (!settled).then_some(delivery),
            record,
        };
        let queued = match self.sends.as_ref() {
            Some(sends) => sends.send(job).map_err(|e| e.0),
            None => Err(job),
        };

        match queued {
            Ok(()) if settled => {
                receiver.release_credit(increment);
                self.stats.fire_and_forget += 1;
            }
            Ok(()) => {}
            Err(job) => {
                warn!(
                    "Source '{}' has no broker producer, rejecting message on '{}'",
                    self.core.name(),
                    job.link
                );
                if let Some(delivery) = job.delivery {
                    receiver.link.disposition(
                        delivery,
                        Outcome::Rejected(ErrorCondition::send_to_broker(BrokerError::Closed)),
                    );
                    self.stats.rejected += 1;
                }
                receiver.release_credit(increment);
            }
        }
    }

    fn complete_send(&mut self, done: SendCompletion) {
        if self.core.is_closed() {
            debug!(
                "Source '{}' closed, ignoring completion for '{}'",
                self.core.name(),
                done.link
            );
            return;
        }
        let increment = self.config.credit_increment;
        let Some(receiver) = self.receivers.get_mut(&done.link) else {
            debug!(
                "Source '{}' link '{}' gone before send completed",
                self.core.name(),
                done.link
            );
            return;
        };

        match done.result {
            Ok(metadata) => {
                debug!(
                    "Source '{}' stored message at {}[{}]@{}",
                    self.core.name(),
                    metadata.topic,
                    metadata.partition,
                    metadata.offset
                );
                receiver.link.disposition(done.delivery, Outcome::Accepted);
                self.stats.accepted += 1;
            }
            Err(e) => {
                warn!(
                    "Source '{}' send failed on '{}': {}",
                    self.core.name(),
                    done.link,
                    e
                );
                receiver.link.disposition(
                    done.delivery,
                    Outcome::Rejected(ErrorCondition::send_to_broker(e)),
                );
                self.stats.rejected += 1;
            }
        }
        receiver.release_credit(increment);
    }

    async fn close_link(&mut self, link: &str) {
        let Some(mut receiver) = self.receivers.remove(link) else {
            debug!("Source '{}' unknown link '{}' closed", self.core.name(), link);
            return;
        };
        receiver.link.close(None);
        info!("Source '{}' link '{}' closed", self.core.name(), link);

        if self.receivers.is_empty() {
            self.close().await;
        }
    }
}

#[async_trait]
impl BridgeEndpoint for AmqpSourceEndpoint {
    type Attach = Box<dyn ReceiverLink>;
    type Output = ();
    type Event = SourceEvent;

    fn name(&self) -> &str {
        self.core.name()
    }

    /// Create the broker producer shared by all links and its sender task
    async fn open(&mut self) -> Result<()> {
        if self.core.is_closed() {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        }
        if self.sends.is_none() {
            let producer = self.broker.create_producer()?;
            let (sends, jobs) = mpsc::unbounded_channel();
            tokio::spawn(send_in_order(
                self.core.name().to_string(),
                producer,
                jobs,
                self.completions_tx.clone(),
            ));
            self.sends = Some(sends);
            info!("Source '{}' opened", self.core.name());
        }
        Ok(())
    }

    async fn handle(&mut self, mut link: Box<dyn ReceiverLink>) -> Result<()> {
        if let Err(e) = self.open().await {
            link.close(None);
            return Err(e);
        }
        let result = self.attach(link).await;
        if result.is_err() && self.receivers.is_empty() {
            self.close().await;
        }
        result
    }

    async fn handle_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Links(reply) => {
                let _ = reply.send(self.link_names());
            }
            _ if self.core.is_closed() => {
                debug!("Source '{}' closed, dropping event", self.core.name());
            }
            SourceEvent::Attach(link) => {
                if let Err(e) = self.handle(link).await {
                    debug!("Source '{}' attach failed: {}", self.core.name(), e);
                }
            }
            SourceEvent::Delivery {
                link,
                delivery,
                message,
            } => self.handle_delivery(link, delivery, message),
            SourceEvent::RemoteClosed { link } | SourceEvent::RemoteDetached { link } => {
                self.close_link(&link).await
            }
        }
    }

    async fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        for (_, mut receiver) in self.receivers.drain() {
            receiver.link.close(None);
        }
        // the sender task finishes queued sends, then closes the producer
        self.sends = None;
        info!("Source '{}' closed", self.core.name());
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Send queued records one at a time, reporting outcomes of unsettled ones
async fn send_in_order(
    endpoint: String,
    producer: Arc<dyn BrokerProducer>,
    mut jobs: mpsc::UnboundedReceiver<SendJob>,
    completions: mpsc::UnboundedSender<SendCompletion>,
) {
    while let Some(job) = jobs.recv().await {
        let result = producer.send(job.record).await;
        match job.delivery {
            Some(delivery) => {
                let _ = completions.send(SendCompletion {
                    link: job.link,
                    delivery,
                    result,
                });
            }
            None => {
                if let Err(e) = result {
                    warn!(
                        "Source '{}' lost settled message on '{}': {}",
                        endpoint, job.link, e
                    );
                }
            }
        }
    }
    producer.close().await;
    debug!("Source '{}' sender stopped", endpoint);
}

/// Posts transport events to a running source endpoint
#[derive(Clone)]
pub struct AmqpSourceHandle {
    name: String,
    tx: mpsc::UnboundedSender<SourceEvent>,
}

impl AmqpSourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the endpoint task has finished
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn attach(&self, link: Box<dyn ReceiverLink>) -> Result<()> {
        self.post(SourceEvent::Attach(link))
    }

    pub fn deliver(&self, link: &str, delivery: Delivery, message: AmqpMessage) -> Result<()> {
        self.post(SourceEvent::Delivery {
            link: link.to_string(),
            delivery,
            message,
        })
    }

    pub fn link_closed(&self, link: &str) -> Result<()> {
        self.post(SourceEvent::RemoteClosed {
            link: link.to_string(),
        })
    }

    pub fn link_detached(&self, link: &str) -> Result<()> {
        self.post(SourceEvent::RemoteDetached {
            link: link.to_string(),
        })
    }

    /// Ask the endpoint which links it serves
    pub async fn links(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.post(SourceEvent::Links(reply))?;
        rx.await.map_err(|_| BridgeError::Closed(self.name.clone()))
    }

    fn post(&self, event: SourceEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| BridgeError::Closed(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::Terminus;
    use crate::broker::memory::MemoryBroker;
    use crate::config::AmqpConverterKind;
    use crate::converter::amqp_converter;
    use crate::testing::{delivery, MockReceiverLink};

    #[tokio::test]
    async fn test_delivery_without_producer_is_rejected() {
        let mut endpoint = AmqpSourceEndpoint::new(
            "unopened",
            AmqpConfig::default(),
            Arc::new(MemoryBroker::default()),
            amqp_converter(AmqpConverterKind::Default),
        );
        let link = MockReceiverLink::new("sender-1").with_target(Terminus::new("orders"));
        endpoint.attach(Box::new(link.clone())).await.unwrap();

        endpoint.handle_delivery("sender-1".to_string(), delivery(3), AmqpMessage::new("lost"));

        let dispositions = link.dispositions();
        assert_eq!(dispositions.len(), 1);
        assert!(matches!(
            &dispositions[0].1,
            Outcome::Rejected(c) if c.code == ConditionCode::SendToBroker
        ));
        assert_eq!(endpoint.stats().rejected, 1);
    }
}
