use crate::message::Message;
use crate::source::{Source, SourceCapabilities};
use crate::view::{View, ViewCapabilities};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One batch-rewriting step (filter, decode, enrich).
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>>;
}

struct FnTransform<F>(F);

#[async_trait]
impl<F, Fut> Transform for FnTransform<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Message>>> + Send + 'static,
{
    async fn apply(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        (self.0)(messages).await
    }
}

/// Wrap an async closure as a pipeline step.
pub fn transform_fn<F, Fut>(f: F) -> Arc<dyn Transform>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Message>>> + Send + 'static,
{
    Arc::new(FnTransform(f))
}

struct SourceTransform(Arc<dyn Source>);

#[async_trait]
impl Transform for SourceTransform {
    async fn apply(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        self.0.transform(messages).await
    }
}

struct ViewFilter(Arc<dyn View>);

#[async_trait]
impl Transform for ViewFilter {
    async fn apply(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        self.0.filter(messages).await
    }
}

struct ViewTransform(Arc<dyn View>);

#[async_trait]
impl Transform for ViewTransform {
    async fn apply(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        self.0.transform(messages).await
    }
}

/// Ordered list of transform steps.
///
/// Step N+1 starts only after step N returned. An empty batch ends the run
/// early.
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn Transform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Arc<dyn Transform>) {
        self.steps.push(step);
    }

    pub fn with(mut self, step: Arc<dyn Transform>) -> Self {
        self.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(&self, mut messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        for step in &self.steps {
            if messages.is_empty() {
                break;
            }
            messages = step.apply(messages).await?;
        }
        Ok(messages)
    }

    /// Compose a flow's pipeline: source transform, flow transform, view
    /// filter, view transform.
    pub(crate) fn for_flow(
        source: &Arc<dyn Source>,
        source_caps: SourceCapabilities,
        flow_transform: Option<Arc<dyn Transform>>,
        view: &Arc<dyn View>,
        view_caps: ViewCapabilities,
    ) -> Self {
        let mut pipeline = Pipeline::new();
        if source_caps.transform {
            pipeline.push(Arc::new(SourceTransform(source.clone())));
        }
        if let Some(step) = flow_transform {
            pipeline.push(step);
        }
        if view_caps.filter {
            pipeline.push(Arc::new(ViewFilter(view.clone())));
        }
        if view_caps.transform {
            pipeline.push(Arc::new(ViewTransform(view.clone())));
        }
        pipeline
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;

    fn msgs(values: &[i64]) -> Vec<Message> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Message::new("test", i as u64, json!(v)))
            .collect()
    }

    fn values(messages: &[Message]) -> Vec<i64> {
        messages.iter().filter_map(|m| m.value.as_i64()).collect()
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let out = Pipeline::new().run(msgs(&[1, 2, 3])).await.unwrap();
        assert_eq!(values(&out), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            pipeline.push(transform_fn(move |messages| {
                let log = log.clone();
                async move {
                    // yield so a concurrent runner would interleave
                    tokio::task::yield_now().await;
                    log.lock().push(name);
                    Ok(messages)
                }
            }));
        }

        pipeline.run(msgs(&[1])).await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let pipeline = Pipeline::new()
            .with(transform_fn(|_messages| async { Ok(Vec::new()) }))
            .with(transform_fn(move |messages| {
                let flag = flag.clone();
                async move {
                    *flag.lock() = true;
                    Ok(messages)
                }
            }));

        let out = pipeline.run(msgs(&[1, 2])).await.unwrap();
        assert!(out.is_empty());
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_step_error_propagates() {
        let pipeline = Pipeline::new()
            .with(transform_fn(|_messages| async { Err(anyhow::anyhow!("bad record")) }));
        let err = pipeline.run(msgs(&[1])).await.unwrap_err();
        assert_eq!(err.to_string(), "bad record");
    }

    proptest! {
        #[test]
        fn prop_filter_then_double_matches_sequential(input in proptest::collection::vec(-100i64..100, 0..40)) {
            let pipeline = Pipeline::new()
                .with(transform_fn(|messages: Vec<Message>| async move {
                    Ok(messages.into_iter().filter(|m| m.value.as_i64().unwrap_or(0) % 2 == 0).collect())
                }))
                .with(transform_fn(|messages: Vec<Message>| async move {
                    Ok(messages
                        .into_iter()
                        .map(|mut m| {
                            m.value = json!(m.value.as_i64().unwrap_or(0) * 2);
                            m
                        })
                        .collect())
                }));

            let out = tokio_test::block_on(pipeline.run(msgs(&input))).unwrap();
            let expected: Vec<i64> = input.iter().filter(|v| *v % 2 == 0).map(|v| v * 2).collect();
            prop_assert_eq!(values(&out), expected);
        }
    }
}
