use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::{AuthValue, NodeTemplate};

/// Unique node identifier within a flow document.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

/// Build status of a single node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    #[default]
    Idle,
    Building,
    Built,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Built => "built",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed build, attached to the node until the next build starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn success(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms: Some(duration_ms),
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms: None,
            error_message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// How the backend delivers build events back to the client.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventDeliveryMode {
    #[default]
    Streaming,
    Polling,
    Direct,
}

impl EventDeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Polling => "polling",
            Self::Direct => "direct",
        }
    }
}

/// Connection state of a node's auth field.
///
/// Always derived from the polling session and the field value, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    AwaitingAuthorization,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn derive(polling: bool, auth: &AuthValue) -> Self {
        match auth {
            AuthValue::Error => Self::Error,
            _ if polling => Self::AwaitingAuthorization,
            AuthValue::Connected(_) => Self::Connected,
            AuthValue::Empty | AuthValue::AuthorizationUrl(_) => Self::Disconnected,
        }
    }
}

/// Operation kind sent to the template mutation service.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOperation {
    /// Fetch or trigger the authorization link.
    OpenAuthorization,
    /// Re-validate the current auth value.
    Validate(String),
    /// Drop the external connection.
    Disconnect,
}

impl MutationOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenAuthorization => "open-authorization",
            Self::Validate(_) => "validate",
            Self::Disconnect => "disconnect",
        }
    }

    /// Value posted for the target field.
    pub fn field_value(&self) -> serde_json::Value {
        match self {
            Self::OpenAuthorization => serde_json::Value::String(String::new()),
            Self::Validate(current) => serde_json::json!({ "validate": current }),
            Self::Disconnect => serde_json::Value::String("disconnect".to_string()),
        }
    }
}

/// A single request to the template mutation service.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub operation: MutationOperation,
    pub node_id: NodeId,
    pub template: NodeTemplate,
    pub field: String,
    pub tool_mode: bool,
}

/// A request to build the flow up to (and including) one node.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub stop_node_id: NodeId,
    pub event_delivery: EventDeliveryMode,
}

/// Error notification handed to the error reporting sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub title: String,
    pub details: Vec<String>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            title: title.into(),
            details,
        }
    }
}

/// One per-node build result in the flow pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexBuild {
    pub id: String,
    pub node_id: NodeId,
    pub valid: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl VertexBuild {
    pub fn to_validation(&self) -> ValidationResult {
        ValidationResult {
            success: self.valid,
            duration_ms: self.duration_ms,
            error_message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Backend-delivered build lifecycle event for a single node.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Started { node_id: NodeId },
    Completed { node_id: NodeId, result: ValidationResult },
    Stopped { node_id: NodeId },
}

impl BuildEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Started { node_id } | Self::Completed { node_id, .. } | Self::Stopped { node_id } => {
                node_id
            }
        }
    }
}

/// Why a polling session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStopReason {
    /// `stop_polling` was called.
    Cancelled,
    /// A newer session for the same key replaced this one.
    Superseded,
    /// The session deadline passed without success.
    TimedOut,
    /// A tick response reported the field as connected.
    Connected,
    /// The initial open-authorization request failed.
    OpenFailed,
}

/// Node event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Build request issued to the backend.
    BuildRequested { node_id: NodeId },
    /// Stop signal sent to the backend.
    BuildStopRequested { node_id: NodeId },
    /// Build status changed.
    StatusChanged { node_id: NodeId, status: BuildStatus },
    /// Node template replaced wholesale.
    TemplateReplaced { node_id: NodeId, revision: u64 },
    /// Polling session started.
    PollingStarted { node_id: NodeId, field: String },
    /// Poll tick issued.
    PollTick { node_id: NodeId, field: String, seq: u64 },
    /// Stale poll response dropped.
    PollStaleDiscarded { node_id: NodeId, seq: u64, applied: u64 },
    /// Polling session ended.
    PollingStopped { node_id: NodeId, field: String, reason: PollStopReason },
    /// Node disconnected from its external account.
    Disconnected { node_id: NodeId, field: String },
}
