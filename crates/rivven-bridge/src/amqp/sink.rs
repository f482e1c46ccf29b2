//! Sink endpoint - consumes from a broker topic, sends to an AMQP receiver
//!
//! Lifecycle:
//!
//! ```text
//! Created ─▶ Attaching ─▶ Subscribing ─┐
//!                     └─▶ Assigning  ──┴▶ Flowing ⇄ Paused ─▶ Closing ─▶ Closed
//! ```
//!
//! Features:
//! - Group-managed subscription, or a pinned partition with optional start offset
//! - At-most-once (pre-settled) and at-least-once (tracked) delivery
//! - Polling stops while the link's send queue is full and resumes on drain
//! - Safe offsets committed as settlements arrive and once more on close

use super::address::{parse_filters, ConsumerAddress};
use super::{DeliveryTag, SenderLink, Terminus};
use crate::broker::{
    BrokerConsumer, BrokerError, ConsumerEvent, ConsumerRecord, ConsumerSettings,
    SharedBrokerClient, TopicPartition,
};
use crate::condition::{ConditionCode, ErrorCondition};
use crate::config::AmqpConfig;
use crate::converter::AmqpMessageConverter;
use crate::endpoint::{BridgeEndpoint, EndpointCore};
use crate::error::{BridgeError, Result};
use crate::qos::{QoS, SenderSettleMode};
use crate::subscription::TopicSubscription;
use crate::tracker::OffsetTracker;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport events for a sink link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The receiver settled an unsettled delivery
    Settled(DeliveryTag),
    /// The send queue has room again
    Drained,
    /// The peer closed the link
    RemoteClosed,
    /// The peer detached the link
    RemoteDetached,
}

/// Sink endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Created,
    Attaching,
    /// Waiting for the group to assign partitions
    Subscribing,
    /// Looking up, assigning and seeking a pinned partition
    Assigning,
    Flowing,
    /// Send queue full, polling suspended until drained
    Paused,
    Closing,
    Closed,
}

/// Counters of a sink endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub records_sent: u64,
    pub records_settled: u64,
    pub commits: u64,
    pub pauses: u64,
    pub resumes: u64,
}

/// Bridges one broker subscription to one AMQP sender link
pub struct AmqpSinkEndpoint {
    core: EndpointCore,
    config: AmqpConfig,
    broker: SharedBrokerClient,
    converter: Arc<dyn AmqpMessageConverter>,
    sender: Option<Box<dyn SenderLink>>,
    source: Option<Terminus>,
    address: String,
    consumer: Option<Box<dyn BrokerConsumer>>,
    tracker: Option<OffsetTracker>,
    qos: Option<QoS>,
    group_id: Option<String>,
    subscriptions: Vec<TopicSubscription>,
    state: SinkState,
    backlog: VecDeque<ConsumerRecord>,
    /// delivery tag -> (partition, offset) of unsettled sends
    unsettled: HashMap<DeliveryTag, (u32, u64)>,
    committed: BTreeMap<u32, u64>,
    last_condition: Option<ErrorCondition>,
    poll_errors: u32,
    stats: SinkStats,
    mailbox_tx: mpsc::UnboundedSender<SinkEvent>,
    mailbox_rx: mpsc::UnboundedReceiver<SinkEvent>,
}

impl AmqpSinkEndpoint {
    pub fn new(
        name: impl Into<String>,
        config: AmqpConfig,
        broker: SharedBrokerClient,
        converter: Arc<dyn AmqpMessageConverter>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        Self {
            core: EndpointCore::new(name),
            config,
            broker,
            converter,
            sender: None,
            source: None,
            address: String::new(),
            consumer: None,
            tracker: None,
            qos: None,
            group_id: None,
            subscriptions: Vec::new(),
            state: SinkState::Created,
            backlog: VecDeque::new(),
            unsettled: HashMap::new(),
            committed: BTreeMap::new(),
            last_condition: None,
            poll_errors: 0,
            stats: SinkStats::default(),
            mailbox_tx,
            mailbox_rx,
        }
    }

    /// Sender for transport events of this endpoint's link
    pub fn mailbox(&self) -> mpsc::UnboundedSender<SinkEvent> {
        self.mailbox_tx.clone()
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn qos(&self) -> Option<QoS> {
        self.qos
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn subscriptions(&self) -> &[TopicSubscription] {
        &self.subscriptions
    }

    /// Offset tracker; present only for at-least-once links
    pub fn tracker(&self) -> Option<&OffsetTracker> {
        self.tracker.as_ref()
    }

    /// Last condition reported for this link
    pub fn last_condition(&self) -> Option<&ErrorCondition> {
        self.last_condition.as_ref()
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Records fetched but not yet sent
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn is_polling(&self) -> bool {
        matches!(self.state, SinkState::Subscribing | SinkState::Flowing)
    }

    /// Drive the endpoint until it closes
    pub async fn run(mut self) {
        debug!("Sink '{}' task started", self.core.name());
        while !self.core.is_closed() {
            while let Ok(event) = self.mailbox_rx.try_recv() {
                self.handle_event(event).await;
                if self.core.is_closed() {
                    return;
                }
            }

            if self.commit().await.is_err() {
                return;
            }

            if self.is_polling() {
                self.poll_once().await;
            } else if let Some(event) = self.mailbox_rx.recv().await {
                self.handle_event(event).await;
            }
        }
    }

    async fn attach(
        &mut self,
        source: Option<Terminus>,
        settle_mode: SenderSettleMode,
    ) -> std::result::Result<(), ErrorCondition> {
        let address = source
            .as_ref()
            .and_then(|s| s.address.clone())
            .unwrap_or_default();
        let consumer_address = ConsumerAddress::parse(&address)?;
        let subscription = match &source {
            Some(source) => parse_filters(&consumer_address.topic, &source.filters)?,
            None => TopicSubscription::new(consumer_address.topic.clone()),
        };
        let qos = QoS::try_from(settle_mode)?;

        info!(
            "Sink '{}' attaching to {} in group '{}' ({})",
            self.core.name(),
            subscription,
            consumer_address.group_id,
            qos
        );

        self.address = address;
        self.source = source;
        self.qos = Some(qos);
        self.group_id = Some(consumer_address.group_id.clone());
        self.subscriptions = vec![subscription.clone()];
        if qos == QoS::AtLeastOnce {
            self.tracker = Some(OffsetTracker::new(subscription.topic()));
        }

        let settings = ConsumerSettings {
            group_id: consumer_address.group_id,
            client_id: self.core.name().to_string(),
            max_poll_records: self.config.max_poll_records,
            offset_reset: self.config.offset_reset,
        };
        let mut consumer = self
            .broker
            .create_consumer(settings)
            .map_err(|e| ErrorCondition::broker_subscribe("Error creating consumer", e))?;

        let result = match subscription.partition_filter() {
            None => {
                self.state = SinkState::Subscribing;
                Self::subscribe(consumer.as_mut(), &subscription).await
            }
            Some(partition) => {
                self.state = SinkState::Assigning;
                Self::assign(consumer.as_mut(), &subscription, partition).await
            }
        };
        self.consumer = Some(consumer);
        result?;

        if self.state == SinkState::Assigning {
            self.open_link();
            self.state = SinkState::Flowing;
        }
        Ok(())
    }

    async fn subscribe(
        consumer: &mut dyn BrokerConsumer,
        subscription: &TopicSubscription,
    ) -> std::result::Result<(), ErrorCondition> {
        let topic = subscription.topic().to_string();
        consumer
            .subscribe(std::slice::from_ref(&topic))
            .await
            .map_err(|e| {
                ErrorCondition::broker_subscribe(&format!("Error subscribing to {}", topic), e)
            })
    }

    async fn assign(
        consumer: &mut dyn BrokerConsumer,
        subscription: &TopicSubscription,
        partition: u32,
    ) -> std::result::Result<(), ErrorCondition> {
        let topic = subscription.topic();
        let partitions = consumer.partitions_for(topic).await.map_err(|e| {
            ErrorCondition::broker_subscribe(&format!("Error getting partitions of {}", topic), e)
        })?;
        if !partitions.iter().any(|p| p.partition == partition) {
            return Err(ErrorCondition::partition_not_exists());
        }

        let tp = TopicPartition::new(topic, partition);
        consumer
            .assign(std::slice::from_ref(&tp))
            .await
            .map_err(|e| ErrorCondition::broker_subscribe(&format!("Error assigning {}", tp), e))?;

        if let Some(offset) = subscription.offset_filter() {
            consumer.seek(&tp, offset).await.map_err(|e| {
                ErrorCondition::broker_subscribe(&format!("Error seeking {} to {}", tp, offset), e)
            })?;
        }
        Ok(())
    }

    fn open_link(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            if !sender.is_open() {
                sender.set_source(self.source.clone());
                sender.open();
                info!("Sink '{}' link opened", self.core.name());
            }
        }
    }

    /// Detach the link with a condition and tear the endpoint down
    async fn fail(&mut self, condition: ErrorCondition) {
        warn!(
            "Sink '{}' detaching link: {}",
            self.core.name(),
            condition
        );
        self.last_condition = Some(condition.clone());
        if let Some(mut sender) = self.sender.take() {
            sender.close(Some(condition));
        }
        self.close().await;
    }

    async fn on_consumer_event(&mut self, event: ConsumerEvent) {
        match event {
            ConsumerEvent::PartitionsAssigned(partitions) => {
                self.on_partitions_assigned(partitions)
            }
            ConsumerEvent::PartitionsRevoked(partitions) => {
                self.on_partitions_revoked(partitions).await
            }
            ConsumerEvent::Records(records) => self.backlog.extend(records),
        }
    }

    /// An empty assignment leaves the link unopened: the peer's attach stays
    /// pending, with `no-free-partitions` as [`last_condition`](Self::last_condition),
    /// until a later assignment hands over partitions.
    fn on_partitions_assigned(&mut self, partitions: Vec<TopicPartition>) {
        if partitions.is_empty() {
            let condition = ErrorCondition::no_partitions();
            warn!(
                "Sink '{}' got no partitions: {}",
                self.core.name(),
                condition.description
            );
            self.last_condition = Some(condition);
            return;
        }

        info!(
            "Sink '{}' assigned partitions {:?}",
            self.core.name(),
            partitions.iter().map(|tp| tp.partition).collect::<Vec<_>>()
        );
        if self
            .last_condition
            .as_ref()
            .is_some_and(|c| c.code == ConditionCode::NoPartitions)
        {
            self.last_condition = None;
        }
        if self.state == SinkState::Subscribing {
            self.open_link();
            self.state = SinkState::Flowing;
        }
    }

    async fn on_partitions_revoked(&mut self, partitions: Vec<TopicPartition>) {
        info!(
            "Sink '{}' partitions revoked {:?}",
            self.core.name(),
            partitions.iter().map(|tp| tp.partition).collect::<Vec<_>>()
        );
        if let Err(e) = self.try_commit().await {
            warn!("Sink '{}' commit before revoke failed: {}", self.core.name(), e);
        }
        for tp in &partitions {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.remove_partition(tp.partition);
            }
            self.committed.remove(&tp.partition);
        }
        self.backlog
            .retain(|r| !partitions.iter().any(|tp| tp.partition == r.partition));
        self.unsettled
            .retain(|_, (partition, _)| !partitions.iter().any(|tp| tp.partition == *partition));
    }

    fn send_record(&mut self, record: ConsumerRecord) {
        let Some(qos) = self.qos else {
            return;
        };
        let tag = DeliveryTag::for_record(record.partition, record.offset);
        let message = self.converter.to_message(&self.address, &record);
        let Some(sender) = self.sender.as_mut() else {
            return;
        };

        match qos {
            QoS::AtMostOnce => sender.send(tag, message, true),
            QoS::AtLeastOnce => {
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.track(&record);
                }
                self.unsettled
                    .insert(tag.clone(), (record.partition, record.offset));
                sender.send(tag, message, false);
            }
        }
        self.stats.records_sent += 1;
        self.flow_check();
    }

    fn flow_check(&mut self) {
        if self.state != SinkState::Flowing {
            return;
        }
        if let Some(sender) = self.sender.as_mut() {
            if sender.send_queue_full() {
                sender.notify_when_drained();
                self.state = SinkState::Paused;
                self.stats.pauses += 1;
                debug!("Sink '{}' send queue full, pausing", self.core.name());
            }
        }
    }

    fn deliver_backlog(&mut self) {
        while self.state == SinkState::Flowing {
            let Some(record) = self.backlog.pop_front() else {
                break;
            };
            self.send_record(record);
        }
    }

    /// Send buffered records, then poll the consumer once if still flowing
    pub async fn poll_once(&mut self) {
        self.deliver_backlog();
        if !self.is_polling() || !self.backlog.is_empty() {
            return;
        }

        let timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let polled = match self.consumer.as_mut() {
            Some(consumer) => consumer.poll(timeout).await,
            None => return,
        };
        match polled {
            Ok(event) => {
                self.poll_errors = 0;
                self.on_consumer_event(event).await;
                self.deliver_backlog();
            }
            Err(e) => {
                self.poll_errors += 1;
                warn!(
                    "Sink '{}' poll failed ({}/{}): {}",
                    self.core.name(),
                    self.poll_errors,
                    self.config.max_consecutive_poll_errors,
                    e
                );
                if self.poll_errors >= self.config.max_consecutive_poll_errors {
                    self.fail(ErrorCondition::broker_consume(e)).await;
                }
            }
        }
    }

    fn on_settled(&mut self, tag: DeliveryTag) {
        let Some((partition, offset)) = self.unsettled.remove(&tag) else {
            debug!(
                "Sink '{}' settlement for unknown delivery {}",
                self.core.name(),
                tag
            );
            return;
        };
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.delivered(partition, offset);
        }
        self.stats.records_settled += 1;
    }

    fn on_drained(&mut self) {
        if self.state == SinkState::Paused {
            self.state = SinkState::Flowing;
            self.stats.resumes += 1;
            debug!("Sink '{}' send queue drained, resuming", self.core.name());
        }
    }

    async fn try_commit(&mut self) -> std::result::Result<(), BrokerError> {
        let (Some(tracker), Some(consumer)) = (self.tracker.as_mut(), self.consumer.as_mut())
        else {
            return Ok(());
        };

        let topic = tracker.topic().to_string();
        let changed: BTreeMap<TopicPartition, u64> = tracker
            .commit_offsets()
            .into_iter()
            .filter(|(partition, offset)| self.committed.get(partition) != Some(offset))
            .map(|(partition, offset)| (TopicPartition::new(topic.clone(), partition), offset))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        consumer.commit(&changed).await?;
        debug!("Sink '{}' committed {:?}", self.core.name(), changed);
        for (tp, offset) in changed {
            self.committed.insert(tp.partition, offset);
        }
        self.stats.commits += 1;
        Ok(())
    }

    /// Commit offsets that became safe since the last commit
    ///
    /// A failed commit detaches the link and closes the endpoint.
    pub async fn commit(&mut self) -> Result<()> {
        if let Err(e) = self.try_commit().await {
            let condition = ErrorCondition::broker_commit(e);
            self.fail(condition.clone()).await;
            return Err(BridgeError::Protocol(condition));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeEndpoint for AmqpSinkEndpoint {
    type Attach = Box<dyn SenderLink>;
    type Output = ();
    type Event = SinkEvent;

    fn name(&self) -> &str {
        self.core.name()
    }

    /// The consumer is created during attach, once the address is known valid
    async fn open(&mut self) -> Result<()> {
        if self.core.is_closed() {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        }
        Ok(())
    }

    async fn handle(&mut self, mut link: Box<dyn SenderLink>) -> Result<()> {
        if self.core.is_closed() {
            return Err(BridgeError::Closed(self.core.name().to_string()));
        }
        if self.state != SinkState::Created {
            let condition = ErrorCondition::new(
                ConditionCode::DuplicateLink,
                "Sink endpoint already serves a link",
            );
            link.close(Some(condition.clone()));
            return Err(BridgeError::Protocol(condition));
        }

        self.state = SinkState::Attaching;
        let source = link.remote_source().cloned();
        let settle_mode = link.settle_mode();
        self.sender = Some(link);

        match self.attach(source, settle_mode).await {
            Ok(()) => Ok(()),
            Err(condition) => {
                self.fail(condition.clone()).await;
                Err(BridgeError::Protocol(condition))
            }
        }
    }

    async fn handle_event(&mut self, event: SinkEvent) {
        if self.core.is_closed() {
            debug!("Sink '{}' closed, dropping {:?}", self.core.name(), event);
            return;
        }
        match event {
            SinkEvent::Settled(tag) => self.on_settled(tag),
            SinkEvent::Drained => self.on_drained(),
            SinkEvent::RemoteClosed | SinkEvent::RemoteDetached => {
                info!("Sink '{}' link closed by peer", self.core.name());
                self.close().await;
            }
        }
    }

    async fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        self.state = SinkState::Closing;

        if let Err(e) = self.try_commit().await {
            warn!(
                "Sink '{}' failed to commit final offsets: {}",
                self.core.name(),
                e
            );
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.clear();
        }
        if let Some(mut sender) = self.sender.take() {
            if sender.is_open() {
                sender.close(None);
            }
        }
        if let Some(mut consumer) = self.consumer.take() {
            consumer.close().await;
        }
        self.backlog.clear();
        self.unsettled.clear();
        self.state = SinkState::Closed;
        info!("Sink '{}' closed", self.core.name());
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
