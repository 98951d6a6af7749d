use super::actor::{Command, FlowActor, FlowShared, Hooks, Reply};
use super::state::{FlowState, FlowStatus};
use super::FlowEvent;
use crate::api::Api;
use crate::error::{KappaError, Result};
use crate::pipeline::{Pipeline, Transform};
use crate::source::{FlowContext, Source, SourceCapabilities, UpdateNotifier};
use crate::view::{effective_version, View};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

/// Per-flow options given to `use_flow_with`.
#[derive(Clone, Default)]
pub struct FlowOptions {
    /// Step run between the source transform and the view filter
    pub transform: Option<Arc<dyn Transform>>,
}

impl FlowOptions {
    pub fn transform(mut self, step: Arc<dyn Transform>) -> Self {
        self.transform = Some(step);
        self
    }
}

impl fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOptions")
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowSettings {
    pub(crate) event_capacity: usize,
    pub(crate) start_paused: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            start_paused: false,
        }
    }
}

struct FlowInner {
    shared: Arc<FlowShared>,
    commands: mpsc::UnboundedSender<Command>,
    version: u32,
    source: Arc<dyn Source>,
    view: Arc<dyn View>,
    source_caps: SourceCapabilities,
    source_api: Api,
    view_api: Api,
}

/// Cloneable handle to a running flow.
///
/// Every operation is forwarded to the flow's actor task, so handles can be
/// used from any task. The actor stops once all handles are dropped.
#[derive(Clone)]
pub struct FlowHandle {
    inner: Arc<FlowInner>,
}

impl FlowHandle {
    /// Spawn a flow on the current tokio runtime. The flow stays closed until
    /// `open`, `ready` or `resume` is called.
    pub fn spawn(
        name: impl Into<String>,
        source: Arc<dyn Source>,
        view: Arc<dyn View>,
        options: FlowOptions,
    ) -> Self {
        Self::spawn_with(name, source, view, options, FlowSettings::default())
    }

    pub(crate) fn spawn_with(
        name: impl Into<String>,
        source: Arc<dyn Source>,
        view: Arc<dyn View>,
        options: FlowOptions,
        settings: FlowSettings,
    ) -> Self {
        let name = name.into();
        let source_caps = source.capabilities();
        let view_caps = view.capabilities();
        let version = effective_version(view.as_ref());
        let pipeline = Pipeline::for_flow(&source, source_caps, options.transform, &view, view_caps);

        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));

        let mut initial = FlowState::default();
        if settings.start_paused {
            initial.status = FlowStatus::Paused;
        }
        let shared = Arc::new(FlowShared {
            name: name.clone(),
            state: RwLock::new(initial.clone()),
            events,
        });

        // Weak so a source holding the notifier does not keep the flow alive.
        let weak = commands.downgrade();
        let notifier = UpdateNotifier::new(move || {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(Command::Update);
            }
        });
        let context = FlowContext::new(name.clone(), version, notifier);

        let hooks = Hooks::new(source.clone(), view.clone(), source_caps, view_caps);
        debug!(flow = %name, version, steps = pipeline.len(), "spawning flow");
        let actor = FlowActor::new(shared.clone(), receiver, hooks, pipeline, context, initial);
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(FlowInner {
                shared,
                commands,
                version,
                source_api: source.api(),
                view_api: view.api().with_ready(),
                source,
                view,
                source_caps,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.inner.source
    }

    pub fn view(&self) -> &Arc<dyn View> {
        &self.inner.view
    }

    pub(crate) fn source_api(&self) -> Api {
        self.inner.source_api.clone()
    }

    pub(crate) fn view_api(&self) -> Api {
        self.inner.view_api.clone()
    }

    fn closed_error(&self) -> KappaError {
        KappaError::FlowClosed(self.name().to_string())
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(tx))
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Open source and view and reconcile the stored version. Idempotent.
    pub async fn open(&self) -> Result<()> {
        self.request(Command::Open).await
    }

    /// Open in the background. Failures reach subscribers as error events.
    pub(crate) fn start(&self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.inner.commands.send(Command::Open(tx));
    }

    /// Resolves once the flow is open, the source is ready and no cycle is
    /// pending.
    pub async fn ready(&self) -> Result<()> {
        self.open().await?;
        if self.inner.source_caps.ready {
            self.inner
                .source
                .ready()
                .await
                .map_err(|e| KappaError::open(self.name(), e.context("source ready")))?;
        }
        self.request(Command::Ready).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    /// Pause, clear view and cursor, resume.
    pub async fn reset(&self) -> Result<()> {
        self.request(Command::Reset).await
    }

    /// Wait for any in-flight cycle, then run the close hooks. Closing an
    /// already closed flow succeeds.
    pub async fn close(&self) -> Result<()> {
        match self.request(Command::Close).await {
            Err(KappaError::FlowClosed(_)) => Ok(()),
            other => other,
        }
    }

    /// Request another cycle. Never interrupts a running one.
    pub fn update(&self) {
        let _ = self.inner.commands.send(Command::Update);
    }

    pub fn get_state(&self) -> FlowState {
        self.inner.shared.state.read().clone()
    }

    pub fn status(&self) -> FlowStatus {
        self.inner.shared.state.read().status
    }

    /// Events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.shared.events.subscribe()
    }
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("name", &self.name())
            .field("version", &self.inner.version)
            .field("status", &self.status())
            .finish()
    }
}
