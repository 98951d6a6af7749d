//! Messages, batches and the commit callback carried by a pull result.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One record read from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the log the record came from
    pub key: String,
    /// Position of the record within that log
    pub seq: u64,
    pub value: Value,
}

impl Message {
    pub fn new(key: impl Into<String>, seq: u64, value: Value) -> Self {
        Self {
            key: key.into(),
            seq,
            value,
        }
    }
}

/// Progress snapshot reported by a source after a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingProgress {
    pub total_blocks: u64,
    pub indexed_blocks: u64,
    pub prev_indexed_blocks: u64,
}

impl IndexingProgress {
    pub fn new(total_blocks: u64, indexed_blocks: u64, prev_indexed_blocks: u64) -> Self {
        Self {
            total_blocks,
            indexed_blocks,
            prev_indexed_blocks,
        }
    }

    /// Accumulate another source's progress (used by fan-in sources).
    pub fn merge(&mut self, other: &IndexingProgress) {
        self.total_blocks += other.total_blocks;
        self.indexed_blocks += other.indexed_blocks;
        self.prev_indexed_blocks += other.prev_indexed_blocks;
    }
}

/// Commit callback. Persists the cursor for the batch it belongs to.
pub type OnIndexed =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Option<IndexingProgress>>> + Send>;

/// Result of a successful pull.
pub struct Batch {
    pub messages: Vec<Message>,
    /// True when the source has no further backlog after this batch
    pub finished: bool,
    pub on_indexed: Option<OnIndexed>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            finished: true,
            on_indexed: None,
        }
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = finished;
        self
    }

    pub fn on_indexed<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<IndexingProgress>>>
            + Send
            + 'static,
    {
        self.on_indexed = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("messages", &self.messages.len())
            .field("finished", &self.finished)
            .field("on_indexed", &self.on_indexed.is_some())
            .finish()
    }
}
