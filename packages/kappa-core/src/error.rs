use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KappaError>;

/// Errors surfaced by flows and the orchestrator.
///
/// Cloneable so the same error can be stored in a flow's state snapshot and
/// broadcast to every subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum KappaError {
    #[error("Failed to open flow {flow}: {message}")]
    Open { flow: String, message: String },

    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Map failed: {0}")]
    Map(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Reset failed: {0}")]
    Reset(String),

    #[error("Close failed: {0}")]
    Close(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Flow already exists: {0}")]
    FlowExists(String),

    #[error("Flow is closed: {0}")]
    FlowClosed(String),

    #[error("Unknown api function {namespace}.{function}")]
    UnknownApi { namespace: String, function: String },

    #[error("Api call failed: {0}")]
    Api(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KappaError {
    pub fn open<E: std::fmt::Display>(flow: &str, e: E) -> Self {
        Self::Open {
            flow: flow.to_string(),
            message: format!("{:#}", e),
        }
    }

    pub fn pull<E: std::fmt::Display>(e: E) -> Self {
        Self::Pull(format!("{:#}", e))
    }

    pub fn transform<E: std::fmt::Display>(e: E) -> Self {
        Self::Transform(format!("{:#}", e))
    }

    pub fn map<E: std::fmt::Display>(e: E) -> Self {
        Self::Map(format!("{:#}", e))
    }

    pub fn commit<E: std::fmt::Display>(e: E) -> Self {
        Self::Commit(format!("{:#}", e))
    }

    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Stable identifier of the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            KappaError::Open { .. } => "open",
            KappaError::Pull(_) => "pull",
            KappaError::Transform(_) => "transform",
            KappaError::Map(_) => "map",
            KappaError::Commit(_) => "commit",
            KappaError::Reset(_) => "reset",
            KappaError::Close(_) => "close",
            KappaError::UnknownFlow(_) => "unknown_flow",
            KappaError::FlowExists(_) => "flow_exists",
            KappaError::FlowClosed(_) => "flow_closed",
            KappaError::UnknownApi { .. } => "unknown_api",
            KappaError::Api(_) => "api",
            KappaError::Storage(_) => "storage",
            KappaError::Config(_) => "config",
        }
    }
}
