//! Link dispatcher
//!
//! The AMQP transport calls into [`AmqpBridge`] whenever a peer attaches a
//! link. Sender links (peer wants to receive) each get their own sink
//! endpoint. Receiver links (peer wants to send) join the source endpoint of
//! their connection, which is created on first use and replaced once it has
//! closed.

use super::sink::{AmqpSinkEndpoint, SinkEvent};
use super::source::{AmqpSourceEndpoint, AmqpSourceHandle};
use super::{ReceiverLink, SenderLink};
use crate::broker::SharedBrokerClient;
use crate::config::{AmqpConfig, BridgeConfig};
use crate::converter::{amqp_converter, AmqpMessageConverter};
use crate::endpoint::BridgeEndpoint;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

const DEFAULT_BRIDGE_ID: &str = "rivven-bridge";

/// Dispatches attached AMQP links to bridge endpoints
pub struct AmqpBridge {
    bridge_id: String,
    config: AmqpConfig,
    broker: SharedBrokerClient,
    converter: Arc<dyn AmqpMessageConverter>,
    /// connection id -> source endpoint; held across endpoint start so one
    /// connection never gets two sources
    sources: Mutex<HashMap<String, AmqpSourceHandle>>,
}

impl AmqpBridge {
    pub fn new(config: &BridgeConfig, broker: SharedBrokerClient) -> Self {
        Self {
            bridge_id: config
                .bridge_id
                .clone()
                .unwrap_or_else(|| DEFAULT_BRIDGE_ID.to_string()),
            config: config.amqp.clone(),
            broker,
            converter: amqp_converter(config.amqp.message_converter),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Start a sink endpoint for a sender link
    ///
    /// Returns the mailbox the transport posts settlements, drain
    /// notifications and remote close events to.
    pub async fn attach_sender(
        &self,
        link: Box<dyn SenderLink>,
    ) -> Result<mpsc::UnboundedSender<SinkEvent>> {
        let name = format!("{}-{}", self.bridge_id, link.name());
        let mut endpoint = AmqpSinkEndpoint::new(
            name,
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.converter),
        );
        endpoint.open().await?;
        endpoint.handle(link).await?;

        let mailbox = endpoint.mailbox();
        tokio::spawn(endpoint.run());
        Ok(mailbox)
    }

    /// Hand a receiver link to the source endpoint of its connection
    pub async fn attach_receiver(
        &self,
        connection: &str,
        link: Box<dyn ReceiverLink>,
    ) -> Result<AmqpSourceHandle> {
        let mut sources = self.sources.lock().await;
        let live = sources
            .get(connection)
            .filter(|h| !h.is_closed())
            .cloned();
        let handle = match live {
            Some(handle) => handle,
            None => {
                let handle = self.start_source(connection).await?;
                sources.insert(connection.to_string(), handle.clone());
                handle
            }
        };
        drop(sources);

        handle.attach(link)?;
        Ok(handle)
    }

    /// Close the links of a connection that went away
    pub async fn connection_closed(&self, connection: &str) {
        let handle = self.sources.lock().await.remove(connection);
        let Some(handle) = handle else {
            return;
        };
        debug!("Connection '{}' closed, closing its links", connection);
        if let Ok(links) = handle.links().await {
            for link in links {
                let _ = handle.link_closed(&link);
            }
        }
    }

    /// Number of connections with a live source endpoint
    pub async fn source_count(&self) -> usize {
        self.sources
            .lock()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    async fn start_source(&self, connection: &str) -> Result<AmqpSourceHandle> {
        let name = format!("{}-{}", self.bridge_id, connection);
        let mut endpoint = AmqpSourceEndpoint::new(
            name,
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.converter),
        );
        endpoint.open().await?;
        let handle = endpoint.source_handle();
        tokio::spawn(endpoint.run());
        info!("Started source endpoint '{}'", handle.name());
        Ok(handle)
    }
}
