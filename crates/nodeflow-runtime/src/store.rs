use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::event::EventBus;
use nodeflow_core::template::NodeTemplate;
use nodeflow_core::types::{BuildStatus, NodeEvent, NodeId, ValidationResult, VertexBuild};

/// Presentation flags carried alongside a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFlags {
    pub selected: bool,
    pub frozen: bool,
    pub user_edited: bool,
    pub dismissed: bool,
    pub breaking_change: bool,
}

/// Snapshot of one node. Never mutated in place: every change produces a new
/// record that replaces the old one in the store.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub template: NodeTemplate,
    /// Bumped on every template replacement.
    pub revision: u64,
    pub status: BuildStatus,
    pub validation: Option<ValidationResult>,
    pub flags: NodeFlags,
}

impl NodeRecord {
    pub fn new(id: NodeId, template: NodeTemplate) -> Self {
        Self {
            id,
            template,
            revision: 0,
            status: BuildStatus::Idle,
            validation: None,
            flags: NodeFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the node was last built with a different runtime version.
    pub fn is_outdated(&self, runtime_version: &str) -> bool {
        match &self.template.version {
            Some(v) => v != runtime_version,
            None => false,
        }
    }
}

/// Shared node store. Readers get `Arc` snapshots; writers swap whole records.
pub struct NodeStore {
    nodes: RwLock<HashMap<NodeId, Arc<NodeRecord>>>,
    event_bus: Arc<EventBus>,
}

impl NodeStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    pub async fn insert(&self, record: NodeRecord) -> Arc<NodeRecord> {
        let record = Arc::new(record);
        self.nodes
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<NodeRecord>> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &NodeId) -> Result<Arc<NodeRecord>> {
        self.get(id)
            .await
            .ok_or_else(|| NodeflowError::NodeNotFound(id.to_string()))
    }

    pub async fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace a record with the output of `f` applied to the current one.
    pub async fn update<F>(&self, id: &NodeId, f: F) -> Result<Arc<NodeRecord>>
    where
        F: FnOnce(&NodeRecord) -> NodeRecord,
    {
        let mut nodes = self.nodes.write().await;
        let current = nodes
            .get(id)
            .ok_or_else(|| NodeflowError::NodeNotFound(id.to_string()))?;
        let next = Arc::new(f(current));
        nodes.insert(id.clone(), next.clone());
        Ok(next)
    }

    /// Replace the node's template wholesale and bump its revision.
    pub async fn replace_template(&self, id: &NodeId, template: NodeTemplate) -> Result<u64> {
        let record = self
            .update(id, |old| NodeRecord {
                template,
                revision: old.revision + 1,
                ..old.clone()
            })
            .await?;

        debug!(node = %id, revision = record.revision, "Template replaced");
        self.event_bus.publish(NodeEvent::TemplateReplaced {
            node_id: id.clone(),
            revision: record.revision,
        });
        Ok(record.revision)
    }

    /// Mark exactly one node as selected.
    pub async fn select(&self, id: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(id) {
            return Err(NodeflowError::NodeNotFound(id.to_string()));
        }
        for (key, record) in nodes.iter_mut() {
            let selected = key == id;
            if record.flags.selected != selected {
                let mut next = NodeRecord::clone(record);
                next.flags.selected = selected;
                *record = Arc::new(next);
            }
        }
        Ok(())
    }
}

/// Aggregate of per-node build results for the current flow.
#[derive(Default)]
pub struct FlowPool {
    builds: RwLock<HashMap<NodeId, Vec<VertexBuild>>>,
}

impl FlowPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, build: VertexBuild) {
        self.builds
            .write()
            .await
            .entry(build.node_id.clone())
            .or_default()
            .push(build);
    }

    pub async fn latest(&self, id: &NodeId) -> Option<VertexBuild> {
        self.builds
            .read()
            .await
            .get(id)
            .and_then(|builds| builds.last().cloned())
    }

    pub async fn len(&self, id: &NodeId) -> usize {
        self.builds.read().await.get(id).map_or(0, Vec::len)
    }

    pub async fn clear_node(&self, id: &NodeId) {
        self.builds.write().await.remove(id);
    }
}
