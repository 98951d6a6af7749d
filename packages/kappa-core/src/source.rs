use crate::api::Api;
use crate::message::{Batch, Message};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Wakes a flow when its source has new data.
///
/// Calling [`UpdateNotifier::notify`] after the flow is gone is a no-op.
#[derive(Clone)]
pub struct UpdateNotifier(Arc<dyn Fn() + Send + Sync>);

impl UpdateNotifier {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn notify(&self) {
        (self.0)()
    }
}

impl fmt::Debug for UpdateNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdateNotifier")
    }
}

/// Handed to sources and views when their flow opens.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub name: String,
    pub version: u32,
    notifier: UpdateNotifier,
}

impl FlowContext {
    pub fn new(name: impl Into<String>, version: u32, notifier: UpdateNotifier) -> Self {
        Self {
            name: name.into(),
            version,
            notifier,
        }
    }

    pub fn notifier(&self) -> UpdateNotifier {
        self.notifier.clone()
    }

    /// Request another run cycle on the owning flow.
    pub fn update(&self) {
        self.notifier.notify()
    }
}

/// Optional methods a [`Source`] implements.
///
/// Read once when the flow is built; the flow never calls a method whose
/// flag is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub open: bool,
    pub ready: bool,
    pub reset: bool,
    /// `fetch_version` / `store_version` are implemented
    pub versioned: bool,
    pub close: bool,
    pub transform: bool,
}

/// Pull-based cursor over one or more append-only logs.
#[async_trait]
pub trait Source: Send + Sync {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    async fn open(&self, _ctx: &FlowContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Next batch after the committed cursor. `Ok(None)` means no work.
    ///
    /// Called at most once per cycle. Must not advance the cursor; that is
    /// the job of the batch's commit callback.
    async fn pull(&self) -> anyhow::Result<Option<Batch>>;

    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Clear the cursor.
    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_version(&self) -> anyhow::Result<Option<u32>> {
        Ok(None)
    }

    async fn store_version(&self, _version: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transform(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        Ok(messages)
    }

    fn api(&self) -> Api {
        Api::new()
    }
}
