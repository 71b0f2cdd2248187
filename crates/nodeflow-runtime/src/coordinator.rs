//! Per-canvas facade that wires the node store, build status machine,
//! authorization poller, and run trigger around one set of collaborators.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nodeflow_core::config::AppConfig;
use nodeflow_core::error::Result;
use nodeflow_core::event::EventBus;
use nodeflow_core::traits::{
    AnalyticsSink, BuildService, ErrorSink, TemplateMutationService, UrlOpener,
};
use nodeflow_core::types::{BuildEvent, BuildStatus, ConnectionState, NodeId, ValidationResult};

use crate::connection::{ConnectOutcome, ConnectionController};
use crate::polling::AuthPoller;
use crate::presentation::{
    needs_update_warning, run_icon, run_tooltip, status_indicator, validation_summary,
    ConnectButton, RunIcon, StatusIndicator,
};
use crate::status::BuildStatusMachine;
use crate::store::{FlowPool, NodeRecord, NodeStore};
use crate::trigger::{BuildTrigger, RunOutcome};

/// External services the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub mutation: Arc<dyn TemplateMutationService>,
    pub build: Arc<dyn BuildService>,
    pub errors: Arc<dyn ErrorSink>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub opener: Arc<dyn UrlOpener>,
}

/// Everything the rendering layer needs to draw one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub display_name: String,
    pub status: BuildStatus,
    pub validation: Option<ValidationResult>,
    pub indicator: StatusIndicator,
    pub run_icon: RunIcon,
    pub run_tooltip: &'static str,
    pub summary: String,
    /// Present only for nodes with an auth field.
    pub connect: Option<ConnectButton>,
    pub is_polling: bool,
    pub frozen: bool,
    pub outdated: bool,
    pub show_update_warning: bool,
}

pub struct NodeCoordinator {
    config: AppConfig,
    store: Arc<NodeStore>,
    pool: Arc<FlowPool>,
    event_bus: Arc<EventBus>,
    status: Arc<BuildStatusMachine>,
    poller: Arc<AuthPoller>,
    trigger: Arc<BuildTrigger>,
    connection: Arc<ConnectionController>,
}

impl NodeCoordinator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let store = Arc::new(NodeStore::new(event_bus.clone()));
        let pool = Arc::new(FlowPool::new());

        let status = Arc::new(BuildStatusMachine::new(
            store.clone(),
            pool.clone(),
            event_bus.clone(),
            config.runtime_version.clone(),
        ));
        let poller = Arc::new(AuthPoller::new(
            collaborators.mutation,
            store.clone(),
            collaborators.errors.clone(),
            collaborators.opener,
            event_bus.clone(),
            config.polling.clone(),
        ));
        let trigger = Arc::new(BuildTrigger::new(
            collaborators.build,
            collaborators.analytics,
            collaborators.errors,
            store.clone(),
            pool.clone(),
            event_bus.clone(),
            config.build.clone(),
        ));
        let connection = Arc::new(ConnectionController::new(
            poller.clone(),
            store.clone(),
            event_bus.clone(),
            config.auth.clone(),
        ));

        Self {
            config,
            store,
            pool,
            event_bus,
            status,
            poller,
            trigger,
            connection,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<FlowPool> {
        &self.pool
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn poller(&self) -> &Arc<AuthPoller> {
        &self.poller
    }

    pub fn connection(&self) -> &Arc<ConnectionController> {
        &self.connection
    }

    pub async fn add_node(&self, record: NodeRecord) -> Arc<NodeRecord> {
        self.store.insert(record).await
    }

    /// Whether any node on the canvas is currently building.
    pub async fn flow_is_building(&self) -> bool {
        for id in self.store.ids().await {
            if self.status.status(&id).await == BuildStatus::Building {
                return true;
            }
        }
        false
    }

    /// Apply one backend build event.
    pub async fn ingest(&self, event: BuildEvent) -> Result<()> {
        let node_id = event.node_id().clone();
        let finished = matches!(event, BuildEvent::Completed { .. } | BuildEvent::Stopped { .. });
        let result = self.status.apply(event).await;
        if finished {
            self.trigger.on_build_finished(&node_id).await;
        }
        result
    }

    /// Drain `rx` into [`ingest`](Self::ingest) until it closes or `cancel` fires.
    pub fn spawn_build_listener(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<BuildEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let node = event.node_id().clone();
                        if let Err(e) = this.ingest(event).await {
                            warn!(node = %node, error = %e, "Dropping build event");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Coordinator build listener stopped");
        })
    }

    /// Stop any session whose auth field turns connected, whoever replaced
    /// the template.
    pub fn spawn_authorization_watcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.connection.clone().watch_authorization(cancel))
    }

    pub async fn request_run(&self, node_id: &NodeId, hovered: bool) -> Result<RunOutcome> {
        let record = self.store.require(node_id).await?;
        let is_building = self.flow_is_building().await;
        self.trigger
            .request_run(node_id, record.status, is_building, hovered)
            .await
    }

    pub async fn handle_run_shortcut(&self, node_id: &NodeId) -> Result<RunOutcome> {
        let record = self.store.require(node_id).await?;
        let is_building = self.flow_is_building().await;
        self.trigger
            .handle_run_shortcut(node_id, record.status, is_building, record.flags.selected)
            .await
    }

    pub async fn request_connect(&self, node_id: &NodeId) -> Result<ConnectOutcome> {
        self.connection.request_connect(node_id, None).await
    }

    pub async fn request_disconnect(&self, node_id: &NodeId) -> Result<()> {
        self.connection.request_disconnect(node_id, None).await
    }

    pub async fn connection_state(&self, node_id: &NodeId) -> ConnectionState {
        self.connection.connection_state(node_id, None).await
    }

    pub async fn view(&self, node_id: &NodeId, hovered: bool) -> Result<NodeView> {
        let record = self.store.require(node_id).await?;
        // Last build result comes from the flow pool; the record only holds
        // results that arrived before the pool was populated.
        let validation = match record.status {
            BuildStatus::Building => None,
            _ => self
                .pool
                .latest(node_id)
                .await
                .map(|build| build.to_validation())
                .or_else(|| record.validation.clone()),
        };
        let is_polling = self.poller.is_polling_node(node_id).await;

        let connect = match record.template.auth_field(&self.config.auth.default_field) {
            Some((key, _)) => {
                let field_polling = self.poller.is_polling(node_id, key).await;
                let busy = self.connection.is_busy(node_id).await;
                let api_key = record
                    .template
                    .template
                    .get("api_key")
                    .map(|f| f.value_str().to_string())
                    .or_else(|| self.config.backend.api_key.clone());
                Some(ConnectButton::derive(
                    &record.template.display_name,
                    &record.template.auth_value(key),
                    field_polling,
                    busy,
                    self.config.auth.has_usable_api_key(api_key.as_deref()),
                ))
            }
            None => None,
        };

        let outdated = record.is_outdated(&self.config.runtime_version);
        let flags = &record.flags;
        let last_run = validation
            .as_ref()
            .map(|v| v.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string());

        Ok(NodeView {
            id: record.id.clone(),
            display_name: record.template.display_name.clone(),
            status: record.status,
            indicator: status_indicator(record.status, validation.as_ref()),
            run_icon: run_icon(record.status, hovered),
            run_tooltip: run_tooltip(record.status, hovered),
            summary: validation_summary(record.status, validation.as_ref(), last_run.as_deref()),
            validation,
            connect,
            is_polling,
            frozen: flags.frozen,
            outdated,
            show_update_warning: needs_update_warning(
                outdated,
                flags.user_edited,
                flags.dismissed,
                flags.breaking_change,
            ),
        })
    }

    /// Cancel every polling session.
    pub async fn shutdown(&self) {
        self.poller.stop_all().await;
    }
}
