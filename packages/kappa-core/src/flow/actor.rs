//! Single-writer run loop of a flow.
//!
//! The actor owns every mutable piece of a flow. Handles talk to it over a
//! command channel; at most one asynchronous task (open, cycle, clear or
//! close) is in flight at a time and is polled next to the command queue.

use super::state::{FlowState, FlowStatus};
use super::FlowEvent;
use crate::error::{KappaError, Result};
use crate::message::{Batch, IndexingProgress};
use crate::pipeline::Pipeline;
use crate::source::{FlowContext, Source, SourceCapabilities};
use crate::view::{View, ViewCapabilities};
use anyhow::Context;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub(crate) enum Command {
    Open(Reply),
    Ready(Reply),
    Pause(Reply),
    Resume(Reply),
    Reset(Reply),
    Update,
    Close(Reply),
}

/// Written by the actor, read by handles.
pub(crate) struct FlowShared {
    pub(crate) name: String,
    pub(crate) state: RwLock<FlowState>,
    pub(crate) events: broadcast::Sender<FlowEvent>,
}

/// Source and view of a flow with their capability flags.
#[derive(Clone)]
pub(crate) struct Hooks {
    pub(crate) source: Arc<dyn Source>,
    pub(crate) view: Arc<dyn View>,
    pub(crate) source_caps: SourceCapabilities,
    pub(crate) view_caps: ViewCapabilities,
    pub(crate) opened: Arc<OpenedParts>,
}

/// Which open hooks already succeeded. A retried open skips them.
#[derive(Debug, Default)]
pub(crate) struct OpenedParts {
    view: AtomicBool,
    source: AtomicBool,
}

impl Hooks {
    pub(crate) fn new(
        source: Arc<dyn Source>,
        view: Arc<dyn View>,
        source_caps: SourceCapabilities,
        view_caps: ViewCapabilities,
    ) -> Self {
        Self {
            source,
            view,
            source_caps,
            view_caps,
            opened: Arc::new(OpenedParts::default()),
        }
    }

    async fn open(&self, ctx: &FlowContext) -> anyhow::Result<()> {
        let view_open = async {
            if !self.view_caps.open || self.opened.view.load(Ordering::Acquire) {
                return Ok(());
            }
            self.view.open(ctx).await.context("view open")?;
            self.opened.view.store(true, Ordering::Release);
            Ok::<(), anyhow::Error>(())
        };
        let source_open = async {
            if !self.source_caps.open || self.opened.source.load(Ordering::Acquire) {
                return Ok(());
            }
            self.source.open(ctx).await.context("source open")?;
            self.opened.source.store(true, Ordering::Release);
            Ok::<(), anyhow::Error>(())
        };
        let (view_result, source_result) = futures::join!(view_open, source_open);
        view_result?;
        source_result
    }

    /// Clear the view's index and the source's cursor concurrently.
    async fn clear(&self) -> anyhow::Result<()> {
        let view_reset = async {
            if self.view_caps.reset {
                self.view.reset().await.context("view reset")
            } else {
                Ok(())
            }
        };
        let source_reset = async {
            if self.source_caps.reset {
                self.source.reset().await.context("source reset")
            } else {
                Ok(())
            }
        };
        let (view_result, source_result) = futures::join!(view_reset, source_reset);
        view_result?;
        source_result
    }

    async fn close(&self) -> anyhow::Result<()> {
        let view_close = async {
            if self.view_caps.close {
                self.view.close().await.context("view close")
            } else {
                Ok(())
            }
        };
        let source_close = async {
            if self.source_caps.close {
                self.source.close().await.context("source close")
            } else {
                Ok(())
            }
        };
        let (view_result, source_result) = futures::join!(view_close, source_close);
        self.opened.view.store(false, Ordering::Release);
        self.opened.source.store(false, Ordering::Release);
        view_result?;
        source_result
    }
}

enum CycleOutcome {
    Completed {
        finished: bool,
        progress: Option<IndexingProgress>,
    },
    /// Paused before `map`; nothing reached the view
    Dropped,
    /// Paused after `map`; the cursor was not advanced
    Uncommitted,
    Failed(KappaError),
}

enum TaskOutcome {
    Opened(Result<()>),
    Cycle(CycleOutcome),
    Cleared(Result<()>, Vec<Reply>),
    Closed(Result<()>),
}

enum Event {
    Command(Option<Command>),
    Settled(TaskOutcome),
}

async fn settle(task: &mut Option<BoxFuture<'static, TaskOutcome>>) -> TaskOutcome {
    match task {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub(crate) struct FlowActor {
    shared: Arc<FlowShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    hooks: Hooks,
    pipeline: Arc<Pipeline>,
    context: FlowContext,
    version: u32,

    state: FlowState,
    opened: bool,
    closed: bool,
    task: Option<BoxFuture<'static, TaskOutcome>>,
    cancel: Option<CancellationToken>,

    run_requested: bool,
    open_requested: bool,
    reset_requested: bool,
    close_requested: bool,

    open_waiters: Vec<Reply>,
    ready_waiters: Vec<Reply>,
    reset_waiters: Vec<Reply>,
    close_waiters: Vec<Reply>,
}

impl FlowActor {
    pub(crate) fn new(
        shared: Arc<FlowShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        hooks: Hooks,
        pipeline: Pipeline,
        context: FlowContext,
        state: FlowState,
    ) -> Self {
        let version = context.version;
        Self {
            shared,
            commands,
            hooks,
            pipeline: Arc::new(pipeline),
            context,
            version,
            state,
            opened: false,
            closed: false,
            task: None,
            cancel: None,
            run_requested: false,
            open_requested: false,
            reset_requested: false,
            close_requested: false,
            open_waiters: Vec::new(),
            ready_waiters: Vec::new(),
            reset_waiters: Vec::new(),
            close_waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(flow = %self.shared.name, "flow actor started");

        loop {
            self.schedule();

            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                outcome = settle(&mut self.task) => Event::Settled(outcome),
            };

            match event {
                Event::Command(Some(command)) => self.handle(command),
                Event::Command(None) => {
                    debug!(flow = %self.shared.name, "all handles dropped, stopping flow actor");
                    break;
                }
                Event::Settled(outcome) => {
                    self.task = None;
                    self.on_settled(outcome);
                    if self.closed {
                        break;
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn closing(&self) -> bool {
        self.close_requested || self.closed
    }

    fn closed_error(&self) -> KappaError {
        KappaError::FlowClosed(self.shared.name.clone())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Open(reply) => {
                if self.closing() {
                    let _ = reply.send(Err(self.closed_error()));
                } else if self.opened {
                    let _ = reply.send(Ok(()));
                } else {
                    self.open_waiters.push(reply);
                    self.open_requested = true;
                }
            }
            Command::Ready(reply) => {
                if self.closing() {
                    let _ = reply.send(Err(self.closed_error()));
                } else {
                    if !self.opened {
                        self.open_requested = true;
                    }
                    self.ready_waiters.push(reply);
                }
            }
            Command::Pause(reply) => {
                self.pause();
                let _ = reply.send(Ok(()));
            }
            Command::Resume(reply) => {
                self.resume();
                let _ = reply.send(Ok(()));
            }
            Command::Reset(reply) => {
                if self.closing() {
                    let _ = reply.send(Err(self.closed_error()));
                } else {
                    self.pause();
                    self.reset_waiters.push(reply);
                    self.reset_requested = true;
                }
            }
            Command::Update => {
                if self.opened {
                    self.run_requested = true;
                }
            }
            Command::Close(reply) => {
                self.close_waiters.push(reply);
                if !self.close_requested {
                    info!("Closing flow {}", self.name());
                    self.cancel_cycle();
                    self.close_requested = true;
                    self.set_status(FlowStatus::Closing);
                }
            }
        }
    }

    fn cancel_cycle(&self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    fn pause(&mut self) {
        self.cancel_cycle();
        if self.closing() {
            return;
        }
        if self.state.status != FlowStatus::Paused {
            debug!(flow = %self.name(), from = %self.state.status, "pausing flow");
            self.set_status(FlowStatus::Paused);
        }
    }

    fn resume(&mut self) {
        if self.closing() {
            return;
        }
        if !matches!(self.state.status, FlowStatus::Paused | FlowStatus::Error) {
            return;
        }

        self.state.error = None;
        if !self.opened {
            self.set_status(FlowStatus::Closed);
            self.open_requested = true;
            return;
        }

        debug!(flow = %self.name(), "resuming flow");
        self.set_status(FlowStatus::Ready);
        self.run_requested = true;
    }

    /// Start the next task if none is in flight.
    ///
    /// Priority: close, reset, open, cycle.
    fn schedule(&mut self) {
        if self.task.is_some() || self.closed {
            return;
        }

        if self.close_requested {
            self.start_close();
            return;
        }

        if self.reset_requested {
            self.reset_requested = false;
            self.start_clear();
            return;
        }

        if self.open_requested {
            self.open_requested = false;
            if !self.opened {
                self.start_open();
                return;
            }
        }

        if self.opened && self.state.status == FlowStatus::Ready && self.run_requested {
            self.run_requested = false;
            self.start_cycle();
            return;
        }

        self.settle_ready_waiters();
    }

    fn settle_ready_waiters(&mut self) {
        if self.ready_waiters.is_empty() {
            return;
        }
        let idle = self.opened
            && self.state.status == FlowStatus::Ready
            && !self.run_requested
            && self.task.is_none();
        if idle {
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn start_open(&mut self) {
        info!("Opening flow {} (version {})", self.name(), self.version);
        let hooks = self.hooks.clone();
        let ctx = self.context.clone();
        let version = self.version;
        self.task = Some(Box::pin(async move {
            TaskOutcome::Opened(open_flow(hooks, ctx, version).await)
        }));
    }

    fn start_cycle(&mut self) {
        self.set_status(FlowStatus::Running);
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let hooks = self.hooks.clone();
        let pipeline = self.pipeline.clone();
        self.task = Some(Box::pin(async move {
            TaskOutcome::Cycle(run_cycle(hooks, pipeline, token).await)
        }));
    }

    fn start_clear(&mut self) {
        info!("Resetting flow {}", self.name());
        let hooks = self.hooks.clone();
        let waiters = std::mem::take(&mut self.reset_waiters);
        self.task = Some(Box::pin(async move {
            let result = hooks
                .clear()
                .await
                .map_err(|e| KappaError::Reset(format!("{:#}", e)));
            TaskOutcome::Cleared(result, waiters)
        }));
    }

    fn start_close(&mut self) {
        let hooks = self.hooks.clone();
        let opened = self.opened;
        self.task = Some(Box::pin(async move {
            let result = if opened {
                hooks
                    .close()
                    .await
                    .map_err(|e| KappaError::Close(format!("{:#}", e)))
            } else {
                Ok(())
            };
            TaskOutcome::Closed(result)
        }));
    }

    fn on_settled(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Opened(result) => self.finish_open(result),
            TaskOutcome::Cycle(outcome) => self.finish_cycle(outcome),
            TaskOutcome::Cleared(result, waiters) => self.finish_clear(result, waiters),
            TaskOutcome::Closed(result) => self.finish_close(result),
        }
    }

    fn finish_open(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                self.opened = true;
                info!("Flow {} opened", self.name());
                if !self.closing()
                    && matches!(self.state.status, FlowStatus::Closed | FlowStatus::Error)
                {
                    self.state.error = None;
                    self.set_status(FlowStatus::Ready);
                }
                self.run_requested = true;
                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(err) => {
                error!("Failed to open flow {}: {}", self.name(), err);
                self.open_requested = false;
                self.state.error = Some(err.clone());
                self.publish();
                self.emit(FlowEvent::Error(err.clone()));
                for waiter in self.open_waiters.drain(..).chain(self.ready_waiters.drain(..)) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    fn finish_cycle(&mut self, outcome: CycleOutcome) {
        self.cancel = None;
        match outcome {
            CycleOutcome::Completed { finished, progress } => {
                if let Some(progress) = progress {
                    self.state.apply_progress(progress);
                }
                if !finished {
                    self.run_requested = true;
                }
                if self.state.status == FlowStatus::Running {
                    self.state.status = FlowStatus::Ready;
                }
                self.publish();

                if self.state.status == FlowStatus::Ready && !self.run_requested {
                    debug!(
                        flow = %self.name(),
                        indexed = self.state.indexed_blocks,
                        total = self.state.total_blocks,
                        "flow idle"
                    );
                    self.emit(FlowEvent::Idle);
                }
            }
            CycleOutcome::Dropped => {
                debug!(flow = %self.name(), "pulled batch dropped after pause");
            }
            CycleOutcome::Uncommitted => {
                warn!(
                    "Flow {} paused after map, batch left uncommitted and will be delivered again",
                    self.name()
                );
            }
            CycleOutcome::Failed(err) => {
                error!(kind = err.kind(), "Flow {} cycle failed: {}", self.name(), err);
                self.state.error = Some(err.clone());
                if self.state.status == FlowStatus::Running {
                    self.state.status = FlowStatus::Error;
                }
                self.publish();
                self.emit(FlowEvent::Error(err));
            }
        }
    }

    fn finish_clear(&mut self, result: Result<()>, waiters: Vec<Reply>) {
        match &result {
            Ok(()) => {
                info!("Flow {} reset", self.name());
                self.state.clear_progress();
                self.state.error = None;
                self.publish();
                self.resume();
            }
            Err(err) => {
                error!("Failed to reset flow {}: {}", self.name(), err);
                self.state.error = Some(err.clone());
                if !self.closing() {
                    self.state.status = FlowStatus::Error;
                }
                self.publish();
                self.emit(FlowEvent::Error(err.clone()));
            }
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn finish_close(&mut self, result: Result<()>) {
        self.opened = false;
        self.closed = true;
        self.close_requested = false;
        if let Err(err) = &result {
            warn!("Flow {} closed with error: {}", self.name(), err);
            self.state.error = Some(err.clone());
        }
        self.set_status(FlowStatus::Closed);
        info!("Flow {} closed", self.name());

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        let closed = self.closed_error();
        for waiter in self
            .open_waiters
            .drain(..)
            .chain(self.ready_waiters.drain(..))
            .chain(self.reset_waiters.drain(..))
        {
            let _ = waiter.send(Err(closed.clone()));
        }
    }

    fn set_status(&mut self, status: FlowStatus) {
        self.state.status = status;
        self.publish();
    }

    fn publish(&mut self) {
        self.state.updated_at = Some(Utc::now());
        *self.shared.state.write() = self.state.clone();
        let _ = self
            .shared
            .events
            .send(FlowEvent::StateUpdate(self.state.clone()));
    }

    fn emit(&self, event: FlowEvent) {
        let _ = self.shared.events.send(event);
    }
}

async fn open_flow(hooks: Hooks, ctx: FlowContext, version: u32) -> Result<()> {
    let name = ctx.name.clone();
    hooks
        .open(&ctx)
        .await
        .map_err(|e| KappaError::open(&name, e))?;

    if !hooks.source_caps.versioned {
        return Ok(());
    }

    let stored = hooks
        .source
        .fetch_version()
        .await
        .map_err(|e| KappaError::open(&name, e.context("fetch version")))?;

    match stored.filter(|v| *v != 0) {
        Some(stored) if stored == version => return Ok(()),
        Some(stored) => {
            info!(
                "Flow {} version changed ({} -> {}), clearing index",
                name, stored, version
            );
            hooks
                .clear()
                .await
                .map_err(|e| KappaError::open(&name, e))?;
        }
        None => {}
    }

    hooks
        .source
        .store_version(version)
        .await
        .map_err(|e| KappaError::open(&name, e.context("store version")))
}

/// pull -> transform -> map -> commit.
///
/// The cancellation token is checked after every step that hands control to
/// the source or view.
async fn run_cycle(hooks: Hooks, pipeline: Arc<Pipeline>, cancel: CancellationToken) -> CycleOutcome {
    let pulled = hooks.source.pull().await;
    if cancel.is_cancelled() {
        return CycleOutcome::Dropped;
    }

    let Batch {
        messages,
        finished,
        on_indexed,
    } = match pulled {
        Ok(Some(batch)) => batch,
        Ok(None) => {
            return CycleOutcome::Completed {
                finished: true,
                progress: None,
            }
        }
        Err(e) => return CycleOutcome::Failed(KappaError::pull(e)),
    };

    let messages = match pipeline.run(messages).await {
        Ok(messages) => messages,
        Err(e) => return CycleOutcome::Failed(KappaError::transform(e)),
    };
    if cancel.is_cancelled() {
        return CycleOutcome::Dropped;
    }

    if !messages.is_empty() {
        if let Err(e) = hooks.view.map(&messages).await {
            return CycleOutcome::Failed(KappaError::map(e));
        }
        if cancel.is_cancelled() {
            return CycleOutcome::Uncommitted;
        }
        if hooks.view_caps.indexed {
            hooks.view.indexed(&messages).await;
        }
    }

    // Filtered-out batches still commit so the cursor moves past them.
    let progress = match on_indexed {
        Some(commit) => match commit().await {
            Ok(progress) => progress,
            Err(e) => return CycleOutcome::Failed(KappaError::commit(e)),
        },
        None => None,
    };

    CycleOutcome::Completed { finished, progress }
}
