use crate::cursor::CursorState;
use crate::message::{Batch, IndexingProgress, Message};
use crate::source::{FlowContext, Source, SourceCapabilities, UpdateNotifier};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_BATCH: u64 = 50;

/// Random-access, append-only log.
#[async_trait]
pub trait AppendOnlyLog: Send + Sync {
    /// Stable identity, used as message key and cursor name
    fn key(&self) -> String;

    async fn len(&self) -> anyhow::Result<u64>;

    /// Entries in `[from, to)`.
    async fn read(&self, from: u64, to: u64) -> anyhow::Result<Vec<Value>>;

    /// Call `notifier` after every append.
    fn subscribe(&self, notifier: UpdateNotifier);
}

/// Source reading one [`AppendOnlyLog`] from a persisted cursor.
pub struct LogSource<L> {
    log: Arc<L>,
    state: CursorState,
    max_batch: u64,
}

impl<L: AppendOnlyLog> LogSource<L> {
    pub fn new(log: Arc<L>, state: CursorState) -> Self {
        Self {
            log,
            state,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_max_batch(mut self, max_batch: u64) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Committed cursor position.
    pub async fn cursor(&self) -> anyhow::Result<u64> {
        Ok(self.state.get(&self.log.key()).await?.unwrap_or(0))
    }
}

#[async_trait]
impl<L: AppendOnlyLog + 'static> Source for LogSource<L> {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            open: true,
            reset: true,
            versioned: true,
            ..Default::default()
        }
    }

    async fn open(&self, ctx: &FlowContext) -> anyhow::Result<()> {
        self.log.subscribe(ctx.notifier());
        Ok(())
    }

    async fn pull(&self) -> anyhow::Result<Option<Batch>> {
        let key = self.log.key();
        let at = self.cursor().await?;
        let len = self.log.len().await?;
        if at >= len {
            return Ok(None);
        }

        let to = len.min(at + self.max_batch);
        let values = self.log.read(at, to).await?;
        debug!(log = %key, from = at, to, len, "read log range");

        let messages = values
            .into_iter()
            .zip(at..)
            .map(|(value, seq)| Message::new(key.clone(), seq, value))
            .collect();

        let state = self.state.clone();
        Ok(Some(Batch::new(messages).finished(to == len).on_indexed(
            move || async move {
                state.put(&key, to).await?;
                Ok(Some(IndexingProgress::new(len, to, at)))
            },
        )))
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.state.put(&self.log.key(), 0).await?;
        Ok(())
    }

    async fn fetch_version(&self) -> anyhow::Result<Option<u32>> {
        Ok(self.state.fetch_version().await?)
    }

    async fn store_version(&self, version: u32) -> anyhow::Result<()> {
        self.state.store_version(version).await?;
        Ok(())
    }
}

/// In-process append-only log.
pub struct MemoryLog {
    key: String,
    entries: RwLock<Vec<Value>>,
    subscribers: RwLock<Vec<UpdateNotifier>>,
}

impl MemoryLog {
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            entries: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn append(&self, value: Value) -> u64 {
        self.extend(std::iter::once(value))
    }

    /// Append entries and notify subscribers once. Returns the new length.
    pub fn extend(&self, values: impl IntoIterator<Item = Value>) -> u64 {
        let len = {
            let mut entries = self.entries.write();
            entries.extend(values);
            entries.len() as u64
        };
        for notifier in self.subscribers.read().iter() {
            notifier.notify();
        }
        len
    }

    pub fn length(&self) -> u64 {
        self.entries.read().len() as u64
    }
}

#[async_trait]
impl AppendOnlyLog for MemoryLog {
    fn key(&self) -> String {
        self.key.clone()
    }

    async fn len(&self) -> anyhow::Result<u64> {
        Ok(self.length())
    }

    async fn read(&self, from: u64, to: u64) -> anyhow::Result<Vec<Value>> {
        let entries = self.entries.read();
        let len = entries.len() as u64;
        if from > to || to > len {
            anyhow::bail!("range {}..{} out of bounds for log {} of length {}", from, to, self.key, len);
        }
        Ok(entries[from as usize..to as usize].to_vec())
    }

    fn subscribe(&self, notifier: UpdateNotifier) {
        self.subscribers.write().push(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pull_reads_from_cursor_in_batches() {
        let log = MemoryLog::new("feed");
        log.extend((0..5).map(|i| json!(i)));
        let source = LogSource::new(log.clone(), CursorState::in_memory("kv")).with_max_batch(3);

        let batch = source.pull().await.unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert!(!batch.finished);
        assert_eq!(batch.messages[2].seq, 2);
        assert_eq!(batch.messages[0].key, "feed");

        // re-pulling without commit returns the same range
        let again = source.pull().await.unwrap().unwrap();
        assert_eq!(again.messages[0].seq, 0);

        let progress = (batch.on_indexed.unwrap())().await.unwrap();
        assert_eq!(progress, Some(IndexingProgress::new(5, 3, 0)));
        assert_eq!(source.cursor().await.unwrap(), 3);

        let batch = source.pull().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.finished);
        (batch.on_indexed.unwrap())().await.unwrap();

        assert!(source.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_rewinds_cursor() {
        let log = MemoryLog::new("feed");
        log.append(json!("a"));
        let source = LogSource::new(log, CursorState::in_memory("kv"));

        let batch = source.pull().await.unwrap().unwrap();
        (batch.on_indexed.unwrap())().await.unwrap();
        assert_eq!(source.cursor().await.unwrap(), 1);

        source.reset().await.unwrap();
        assert_eq!(source.cursor().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_versions_are_stored_in_cursor_state() {
        let state = CursorState::in_memory("kv");
        let source = LogSource::new(MemoryLog::new("feed"), state.clone());
        assert_eq!(source.fetch_version().await.unwrap(), None);
        source.store_version(3).await.unwrap();
        assert_eq!(state.fetch_version().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_out_of_bounds_read() {
        let log = MemoryLog::new("feed");
        assert!(log.read(0, 1).await.is_err());
    }
}
