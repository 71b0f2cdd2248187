//! Build status state machine.
//!
//! ```text
//! Idle ──start──▶ Building ──ok──▶ Built ──start──▶ Building
//!                    │  └─fail──▶ Error ──start──▶ Building
//!                    └──stop──▶ Idle
//! ```
//!
//! Status only moves in response to backend build events. Polling never
//! touches it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nodeflow_core::error::Result;
use nodeflow_core::event::EventBus;
use nodeflow_core::types::{
    BuildEvent, BuildStatus, NodeEvent, NodeId, ValidationResult, VertexBuild,
};

use crate::store::{FlowPool, NodeRecord, NodeStore};

pub struct BuildStatusMachine {
    store: Arc<NodeStore>,
    pool: Arc<FlowPool>,
    event_bus: Arc<EventBus>,
    runtime_version: String,
}

impl BuildStatusMachine {
    pub fn new(
        store: Arc<NodeStore>,
        pool: Arc<FlowPool>,
        event_bus: Arc<EventBus>,
        runtime_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pool,
            event_bus,
            runtime_version: runtime_version.into(),
        }
    }

    /// Current status, `Idle` for unknown nodes.
    pub async fn status(&self, id: &NodeId) -> BuildStatus {
        self.store
            .get(id)
            .await
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub async fn validation(&self, id: &NodeId) -> Option<ValidationResult> {
        self.store.get(id).await.and_then(|r| r.validation.clone())
    }

    pub async fn on_build_started(&self, id: &NodeId) -> Result<()> {
        self.store
            .update(id, |old| NodeRecord {
                status: BuildStatus::Building,
                validation: None,
                ..old.clone()
            })
            .await?;
        debug!(node = %id, "Build started");
        self.publish_status(id, BuildStatus::Building);
        Ok(())
    }

    pub async fn on_build_completed(&self, id: &NodeId, result: ValidationResult) -> Result<()> {
        let status = if result.success {
            BuildStatus::Built
        } else {
            BuildStatus::Error
        };

        self.pool
            .push(VertexBuild {
                id: Uuid::new_v4().to_string(),
                node_id: id.clone(),
                valid: result.success,
                duration_ms: result.duration_ms,
                message: result.error_message.clone(),
                timestamp: result.timestamp,
            })
            .await;

        let version = self.runtime_version.clone();
        let record = self
            .store
            .update(id, |old| {
                let mut next = NodeRecord {
                    status,
                    validation: Some(result),
                    ..old.clone()
                };
                if status == BuildStatus::Built {
                    next.template.version = Some(version);
                    next.revision = old.revision + 1;
                }
                next
            })
            .await?;

        if status == BuildStatus::Built {
            info!(
                node = %id,
                duration_ms = ?record.validation.as_ref().and_then(|v| v.duration_ms),
                version = %self.runtime_version,
                "Build completed"
            );
            self.event_bus.publish(NodeEvent::TemplateReplaced {
                node_id: id.clone(),
                revision: record.revision,
            });
        } else {
            warn!(
                node = %id,
                error = record
                    .validation
                    .as_ref()
                    .and_then(|v| v.error_message.as_deref())
                    .unwrap_or("unknown"),
                "Build failed"
            );
        }

        self.publish_status(id, status);
        Ok(())
    }

    pub async fn on_build_stopped(&self, id: &NodeId) -> Result<()> {
        self.store
            .update(id, |old| NodeRecord {
                status: BuildStatus::Idle,
                ..old.clone()
            })
            .await?;
        info!(node = %id, "Build stopped");
        self.publish_status(id, BuildStatus::Idle);
        Ok(())
    }

    pub async fn apply(&self, event: BuildEvent) -> Result<()> {
        match event {
            BuildEvent::Started { node_id } => self.on_build_started(&node_id).await,
            BuildEvent::Completed { node_id, result } => {
                self.on_build_completed(&node_id, result).await
            }
            BuildEvent::Stopped { node_id } => self.on_build_stopped(&node_id).await,
        }
    }

    /// Consume build events until the channel closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BuildEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let node = event.node_id().clone();
                    if let Err(e) = self.apply(event).await {
                        warn!(node = %node, error = %e, "Dropping build event");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        debug!("Build event listener stopped");
    }

    fn publish_status(&self, id: &NodeId, status: BuildStatus) {
        self.event_bus.publish(NodeEvent::StatusChanged {
            node_id: id.clone(),
            status,
        });
    }
}
