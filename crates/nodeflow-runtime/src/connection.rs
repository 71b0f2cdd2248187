use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodeflow_core::config::AuthConfig;
use nodeflow_core::error::Result;
use nodeflow_core::event::EventBus;
use nodeflow_core::template::AuthValue;
use nodeflow_core::types::{ConnectionState, NodeEvent, NodeId};

use crate::polling::AuthPoller;
use crate::store::NodeStore;

/// What a connect click turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    PollingStarted,
    Disconnected,
    /// The auth link is in the error state; nothing to do.
    Ignored,
}

/// Connect / disconnect entry points layered over the polling engine.
pub struct ConnectionController {
    poller: Arc<AuthPoller>,
    store: Arc<NodeStore>,
    event_bus: Arc<EventBus>,
    auth: AuthConfig,
    disconnecting: Mutex<HashSet<NodeId>>,
}

impl ConnectionController {
    pub fn new(
        poller: Arc<AuthPoller>,
        store: Arc<NodeStore>,
        event_bus: Arc<EventBus>,
        auth: AuthConfig,
    ) -> Self {
        Self {
            poller,
            store,
            event_bus,
            auth,
            disconnecting: Mutex::new(HashSet::new()),
        }
    }

    pub fn poller(&self) -> &Arc<AuthPoller> {
        &self.poller
    }

    fn field<'a>(&'a self, field: Option<&'a str>) -> &'a str {
        field.unwrap_or(self.auth.default_field.as_str())
    }

    /// Connect button handler: disconnects when already connected, otherwise
    /// starts the authorization handshake.
    pub async fn request_connect(&self, node_id: &NodeId, field: Option<&str>) -> Result<ConnectOutcome> {
        let field = self.field(field);
        let record = self.store.require(node_id).await?;
        let auth = record.template.auth_value(field);

        if auth.is_error() {
            debug!(node = %node_id, field, "Auth link in error state, ignoring connect");
            return Ok(ConnectOutcome::Ignored);
        }

        if auth.is_connected() {
            self.poller.stop_polling(node_id, field).await;
            self.request_disconnect(node_id, Some(field)).await?;
            return Ok(ConnectOutcome::Disconnected);
        }

        self.poller.start_polling_with_defaults(node_id, field).await?;
        Ok(ConnectOutcome::PollingStarted)
    }

    /// Disconnect the node. The node reads as busy until the request settles.
    pub async fn request_disconnect(&self, node_id: &NodeId, field: Option<&str>) -> Result<()> {
        let field = self.field(field);
        self.disconnecting.lock().await.insert(node_id.clone());
        let result = self.poller.disconnect(node_id, field).await;
        self.disconnecting.lock().await.remove(node_id);
        result
    }

    pub async fn connection_state(&self, node_id: &NodeId, field: Option<&str>) -> ConnectionState {
        let field = self.field(field);
        let polling = self.poller.is_polling(node_id, field).await;
        let auth = match self.store.get(node_id).await {
            Some(record) => record.template.auth_value(field),
            None => AuthValue::Empty,
        };
        ConnectionState::derive(polling, &auth)
    }

    /// Polling or disconnecting.
    pub async fn is_busy(&self, node_id: &NodeId) -> bool {
        self.poller.is_polling_node(node_id).await || self.disconnecting.lock().await.contains(node_id)
    }

    /// Watch template replacements and stop any session whose field now reads
    /// connected. Runs until `cancel` fires.
    pub async fn watch_authorization(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.event_bus.subscribe();
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = cancel.cancelled() => break,
            };

            match event {
                Ok(NodeEvent::TemplateReplaced { node_id, .. }) => {
                    self.stop_if_connected(&node_id).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Authorization watcher lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Authorization watcher stopped");
    }

    async fn stop_if_connected(&self, node_id: &NodeId) {
        let Some(record) = self.store.get(node_id).await else {
            return;
        };
        for (key, field) in &record.template.template {
            if !field.is_auth() {
                continue;
            }
            if record.template.auth_value(key).is_connected()
                && self.poller.is_polling(node_id, key).await
            {
                info!(node = %node_id, field = %key, "Authorization satisfied, stopping poll");
                self.poller.stop_polling(node_id, key).await;
            }
        }
    }
}
