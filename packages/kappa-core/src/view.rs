use crate::api::Api;
use crate::message::Message;
use crate::source::FlowContext;
use async_trait::async_trait;

/// Optional methods a [`View`] implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewCapabilities {
    pub open: bool,
    pub close: bool,
    /// Clears the materialized index
    pub reset: bool,
    pub filter: bool,
    pub transform: bool,
    pub indexed: bool,
}

/// Folds ordered message batches into a materialized projection.
#[async_trait]
pub trait View: Send + Sync {
    /// Version of the indexing logic. A change clears the index on next open.
    fn version(&self) -> u32 {
        1
    }

    fn capabilities(&self) -> ViewCapabilities {
        ViewCapabilities::default()
    }

    async fn open(&self, _ctx: &FlowContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn map(&self, messages: &[Message]) -> anyhow::Result<()>;

    async fn filter(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        Ok(messages)
    }

    async fn transform(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        Ok(messages)
    }

    /// Called after `map` accepted a non-empty batch.
    async fn indexed(&self, _messages: &[Message]) {}

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn api(&self) -> Api {
        Api::new()
    }
}

/// Version the flow records for a view. Zero is treated as 1.
pub fn effective_version(view: &dyn View) -> u32 {
    view.version().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Versioned(u32);

    #[async_trait]
    impl View for Versioned {
        fn version(&self) -> u32 {
            self.0
        }

        async fn map(&self, _messages: &[Message]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_effective_version() {
        assert_eq!(effective_version(&Versioned(0)), 1);
        assert_eq!(effective_version(&Versioned(1)), 1);
        assert_eq!(effective_version(&Versioned(7)), 7);
    }
}
