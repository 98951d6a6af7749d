//! Shared fixtures for flow integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use kappa_core::{
    Api, ApiContext, Batch, FlowContext, IndexingProgress, KappaEvent, Message, Source,
    SourceCapabilities, UpdateNotifier, View, ViewCapabilities,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("timed out")
}

const QUIET: Duration = Duration::from_millis(100);

/// Assert `f` is still pending after a short window.
pub async fn stays_pending<F: Future + Unpin>(f: &mut F) {
    assert!(
        tokio::time::timeout(QUIET, f).await.is_err(),
        "completed while expected to stay pending"
    );
}

/// Assert nothing is published on `events` for a short window.
pub async fn assert_quiet<T: Clone + Debug>(events: &mut broadcast::Receiver<T>) {
    if let Ok(event) = tokio::time::timeout(QUIET, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

pub async fn next_event<P>(events: &mut broadcast::Receiver<KappaEvent>, mut pred: P) -> KappaEvent
where
    P: FnMut(&KappaEvent) -> bool,
{
    within(async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
}

pub fn values(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(|m| m.value.clone()).collect()
}

/// Blocks one call until released.
#[derive(Clone, Default)]
pub struct Hold {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Hold {
    pub async fn entered(&self) {
        within(self.entered.notified()).await
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn wait(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

struct SourceInner {
    key: String,
    buf: Mutex<Vec<Value>>,
    cursor: Mutex<u64>,
    max_batch: usize,
    error: Mutex<Option<String>>,
    notifier: Mutex<Option<UpdateNotifier>>,
    hold: Mutex<Option<Hold>>,
    transform: Option<fn(Message) -> Option<Message>>,
    opens: AtomicUsize,
    pulls: AtomicUsize,
    commits: AtomicUsize,
}

impl SourceInner {
    fn push(&self, values: Vec<Value>) {
        self.buf.lock().extend(values);
        self.notify();
    }

    fn notify(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }
}

/// Vector-backed source with an in-memory cursor.
#[derive(Clone)]
pub struct SimpleSource {
    inner: Arc<SourceInner>,
}

impl SimpleSource {
    pub fn new(key: &str) -> Self {
        Self::build(key, 10, None)
    }

    pub fn with_max_batch(key: &str, max_batch: usize) -> Self {
        Self::build(key, max_batch, None)
    }

    pub fn with_transform(key: &str, transform: fn(Message) -> Option<Message>) -> Self {
        Self::build(key, 10, Some(transform))
    }

    fn build(key: &str, max_batch: usize, transform: Option<fn(Message) -> Option<Message>>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                key: key.to_string(),
                buf: Mutex::new(Vec::new()),
                cursor: Mutex::new(0),
                max_batch,
                error: Mutex::new(None),
                notifier: Mutex::new(None),
                hold: Mutex::new(None),
                transform,
                opens: AtomicUsize::new(0),
                pulls: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn push(&self, value: Value) {
        self.inner.push(vec![value]);
    }

    pub fn push_all(&self, values: impl IntoIterator<Item = Value>) {
        self.inner.push(values.into_iter().collect());
    }

    pub fn fail_with(&self, message: &str) {
        *self.inner.error.lock() = Some(message.to_string());
        self.inner.notify();
    }

    pub fn heal(&self) {
        *self.inner.error.lock() = None;
    }

    /// Block the next pull until the returned hold is released.
    pub fn hold_next_pull(&self) -> Hold {
        let hold = Hold::default();
        *self.inner.hold.lock() = Some(hold.clone());
        hold
    }

    pub fn cursor(&self) -> u64 {
        *self.inner.cursor.lock()
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.inner.pulls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for SimpleSource {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            open: true,
            reset: true,
            transform: self.inner.transform.is_some(),
            ..Default::default()
        }
    }

    async fn open(&self, ctx: &FlowContext) -> anyhow::Result<()> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        *self.inner.notifier.lock() = Some(ctx.notifier());
        Ok(())
    }

    async fn pull(&self) -> anyhow::Result<Option<Batch>> {
        self.inner.pulls.fetch_add(1, Ordering::SeqCst);
        let hold = self.inner.hold.lock().take();
        if let Some(hold) = hold {
            hold.wait().await;
        }
        if let Some(error) = self.inner.error.lock().clone() {
            anyhow::bail!(error);
        }

        let at = *self.inner.cursor.lock();
        let (messages, len) = {
            let buf = self.inner.buf.lock();
            let len = buf.len() as u64;
            let end = len.min(at + self.inner.max_batch as u64);
            let messages: Vec<Message> = buf[at as usize..end as usize]
                .iter()
                .zip(at..)
                .map(|(value, seq)| Message::new(self.inner.key.clone(), seq, value.clone()))
                .collect();
            (messages, len)
        };
        let end = at + messages.len() as u64;

        let inner = self.inner.clone();
        Ok(Some(Batch::new(messages).finished(end == len).on_indexed(
            move || async move {
                *inner.cursor.lock() = end;
                inner.commits.fetch_add(1, Ordering::SeqCst);
                Ok(Some(IndexingProgress::new(len, end, at)))
            },
        )))
    }

    async fn reset(&self) -> anyhow::Result<()> {
        *self.inner.cursor.lock() = 0;
        Ok(())
    }

    async fn transform(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        match self.inner.transform {
            Some(f) => Ok(messages.into_iter().filter_map(f).collect()),
            None => Ok(messages),
        }
    }

    fn api(&self) -> Api {
        let push = self.inner.clone();
        let fail = self.inner.clone();
        Api::new()
            .with("push", move |_ctx: ApiContext, args| {
                let inner = push.clone();
                async move {
                    match args {
                        Value::Array(values) => inner.push(values),
                        value => inner.push(vec![value]),
                    }
                    Ok(Value::Null)
                }
            })
            .with("error", move |_ctx: ApiContext, args| {
                let inner = fail.clone();
                async move {
                    *inner.error.lock() = Some(args.as_str().unwrap_or("error").to_string());
                    inner.notify();
                    Ok(Value::Null)
                }
            })
    }
}

struct ViewInner {
    version: u32,
    messages: Mutex<Vec<Message>>,
    clears: AtomicUsize,
    closes: AtomicUsize,
    opens: AtomicUsize,
    open_error: Mutex<Option<String>>,
    map_error: Mutex<Option<String>>,
    map_hold: Mutex<Option<Hold>>,
    filter: Option<fn(&Message) -> bool>,
    transform: Option<fn(Message) -> Message>,
}

/// View collecting every mapped message.
#[derive(Clone)]
pub struct SimpleView {
    inner: Arc<ViewInner>,
}

impl SimpleView {
    pub fn new() -> Self {
        Self::build(1, None, None)
    }

    pub fn with_version(version: u32) -> Self {
        Self::build(version, None, None)
    }

    pub fn with_steps(filter: fn(&Message) -> bool, transform: fn(Message) -> Message) -> Self {
        Self::build(1, Some(filter), Some(transform))
    }

    fn build(
        version: u32,
        filter: Option<fn(&Message) -> bool>,
        transform: Option<fn(Message) -> Message>,
    ) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                version,
                messages: Mutex::new(Vec::new()),
                clears: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                open_error: Mutex::new(None),
                map_error: Mutex::new(None),
                map_hold: Mutex::new(None),
                filter,
                transform,
            }),
        }
    }

    pub fn values(&self) -> Vec<Value> {
        values(&self.inner.messages.lock())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().clone()
    }

    /// Pretend the index already holds `value` (stale data from an older run).
    pub fn seed(&self, value: Value) {
        self.inner
            .messages
            .lock()
            .push(Message::new("seed", 0, value));
    }

    pub fn clears(&self) -> usize {
        self.inner.clears.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Fail the next open with `message`.
    pub fn fail_next_open(&self, message: &str) {
        *self.inner.open_error.lock() = Some(message.to_string());
    }

    pub fn fail_maps(&self, message: &str) {
        *self.inner.map_error.lock() = Some(message.to_string());
    }

    pub fn heal(&self) {
        *self.inner.map_error.lock() = None;
    }

    pub fn hold_next_map(&self) -> Hold {
        let hold = Hold::default();
        *self.inner.map_hold.lock() = Some(hold.clone());
        hold
    }
}

impl Default for SimpleView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl View for SimpleView {
    fn version(&self) -> u32 {
        self.inner.version
    }

    fn capabilities(&self) -> ViewCapabilities {
        ViewCapabilities {
            open: true,
            reset: true,
            close: true,
            filter: self.inner.filter.is_some(),
            transform: self.inner.transform.is_some(),
            ..Default::default()
        }
    }

    async fn open(&self, _ctx: &FlowContext) -> anyhow::Result<()> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.open_error.lock().take() {
            anyhow::bail!(error);
        }
        Ok(())
    }

    async fn map(&self, messages: &[Message]) -> anyhow::Result<()> {
        if let Some(error) = self.inner.map_error.lock().clone() {
            anyhow::bail!(error);
        }
        let hold = self.inner.map_hold.lock().take();
        if let Some(hold) = hold {
            hold.wait().await;
        }
        self.inner.messages.lock().extend_from_slice(messages);
        Ok(())
    }

    async fn filter(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        match self.inner.filter {
            Some(keep) => Ok(messages.into_iter().filter(|m| keep(m)).collect()),
            None => Ok(messages),
        }
    }

    async fn transform(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        match self.inner.transform {
            Some(f) => Ok(messages.into_iter().map(f).collect()),
            None => Ok(messages),
        }
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.inner.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.messages.lock().clear();
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn api(&self) -> Api {
        let collect = self.inner.clone();
        let count = self.inner.clone();
        let clears = self.inner.clone();
        Api::new()
            .with("collect", move |ctx: ApiContext, _args| {
                let inner = collect.clone();
                async move {
                    ctx.flow.ready().await?;
                    Ok(Value::Array(values(&inner.messages.lock())))
                }
            })
            .with("count", move |_ctx: ApiContext, _args| {
                let inner = count.clone();
                async move { Ok(json!(inner.messages.lock().len())) }
            })
            .with("cleared_count", move |_ctx: ApiContext, _args| {
                let inner = clears.clone();
                async move { Ok(json!(inner.clears.load(Ordering::SeqCst))) }
            })
    }
}
