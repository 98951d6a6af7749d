use crate::error::KappaError;
use crate::message::IndexingProgress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flow status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Closed,
    Ready,
    Running,
    Paused,
    Closing,
    Error,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Closed => "closed",
            FlowStatus::Ready => "ready",
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Closing => "closing",
            FlowStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot returned by `get_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub status: FlowStatus,
    pub total_blocks: u64,
    pub indexed_blocks: u64,
    pub prev_indexed_blocks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<KappaError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlowState {
    pub fn progress(&self) -> IndexingProgress {
        IndexingProgress::new(
            self.total_blocks,
            self.indexed_blocks,
            self.prev_indexed_blocks,
        )
    }

    pub(crate) fn apply_progress(&mut self, progress: IndexingProgress) {
        self.total_blocks = progress.total_blocks;
        self.indexed_blocks = progress.indexed_blocks;
        self.prev_indexed_blocks = progress.prev_indexed_blocks;
    }

    pub(crate) fn clear_progress(&mut self) {
        self.indexed_blocks = 0;
        self.prev_indexed_blocks = 0;
    }
}
