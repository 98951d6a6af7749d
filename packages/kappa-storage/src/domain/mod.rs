//! Domain models for persisted cursor state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the cursor table.
///
/// Keys follow the `CursorState` layout: `{prefix}!state!{name}` for cursors
/// and `{prefix}!version!` for the view version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub key: String,
    pub value: u64,
    /// Last write time, `None` for rows written without a timestamp
    pub updated_at: Option<DateTime<Utc>>,
}

impl CursorRecord {
    pub fn new(key: impl Into<String>, value: u64) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at: Some(Utc::now()),
        }
    }

    /// Whether this row stores a view version rather than a cursor.
    pub fn is_version(&self) -> bool {
        self.key.ends_with("!version!")
    }
}
