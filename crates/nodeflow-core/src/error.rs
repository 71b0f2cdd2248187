use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeflowError {
    // Template mutation errors
    #[error("Template mutation failed: {operation}: {message}")]
    Mutation { operation: String, message: String },

    // Build errors
    #[error("Build request failed: {0}")]
    Build(String),

    #[error("Build stop failed: {0}")]
    BuildStop(String),

    // Node errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Auth field not found: {node}: {field}")]
    AuthFieldNotFound { node: String, field: String },

    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeflowError {
    pub fn mutation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mutation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeflowError>;
