use crate::api::{ApiContext, BoundApi};
use crate::config::KappaConfig;
use crate::cursor::CursorState;
use crate::error::{KappaError, Result};
use crate::flow::{FlowEvent, FlowHandle, FlowOptions, FlowSettings, FlowState};
use crate::source::Source;
use crate::sources::{AppendOnlyLog, LogSource};
use crate::view::View;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Aggregate orchestrator status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KappaStatus {
    Running,
    Paused,
    Closed,
}

/// Flow events re-published with the flow's name.
#[derive(Debug, Clone, PartialEq)]
pub enum KappaEvent {
    FlowAdded { name: String },
    StateUpdate { name: String, state: FlowState },
    Error { name: String, error: KappaError },
    Idle { name: String },
}

impl KappaEvent {
    fn from_flow(name: &str, event: FlowEvent) -> Self {
        let name = name.to_string();
        match event {
            FlowEvent::StateUpdate(state) => KappaEvent::StateUpdate { name, state },
            FlowEvent::Error(error) => KappaEvent::Error { name, error },
            FlowEvent::Idle => KappaEvent::Idle { name },
        }
    }

    pub fn flow_name(&self) -> &str {
        match self {
            KappaEvent::FlowAdded { name }
            | KappaEvent::StateUpdate { name, .. }
            | KappaEvent::Error { name, .. }
            | KappaEvent::Idle { name } => name,
        }
    }
}

struct KappaInner {
    flows: RwLock<IndexMap<String, FlowHandle>>,
    status: RwLock<KappaStatus>,
    events: broadcast::Sender<KappaEvent>,
    config: KappaConfig,
}

/// Registry of named flows.
///
/// Cheap to clone; clones share the same flows. Flows are spawned on the
/// ambient tokio runtime, so `use_flow` must be called from within one.
#[derive(Clone)]
pub struct Kappa {
    inner: Arc<KappaInner>,
}

impl Kappa {
    pub fn new() -> Self {
        Self::with_config(KappaConfig::default())
    }

    pub fn with_config(config: KappaConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(KappaInner {
                flows: RwLock::new(IndexMap::new()),
                status: RwLock::new(KappaStatus::Running),
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &KappaConfig {
        &self.inner.config
    }

    pub fn status(&self) -> KappaStatus {
        *self.inner.status.read()
    }

    /// Source over `log` reading batches of the configured size.
    pub fn log_source<L: AppendOnlyLog>(&self, log: Arc<L>, state: CursorState) -> LogSource<L> {
        LogSource::new(log, state).with_max_batch(self.inner.config.max_batch)
    }

    /// Register a flow. Fails with `FlowExists` if the name is taken.
    pub fn use_flow(
        &self,
        name: impl Into<String>,
        source: Arc<dyn Source>,
        view: Arc<dyn View>,
    ) -> Result<FlowHandle> {
        self.use_flow_with(name, source, view, FlowOptions::default())
    }

    pub fn use_flow_with(
        &self,
        name: impl Into<String>,
        source: Arc<dyn Source>,
        view: Arc<dyn View>,
        options: FlowOptions,
    ) -> Result<FlowHandle> {
        let name = name.into();
        let status = self.status();
        if status == KappaStatus::Closed {
            return Err(KappaError::FlowClosed(name));
        }

        let flow = {
            let mut flows = self.inner.flows.write();
            if flows.contains_key(&name) {
                return Err(KappaError::FlowExists(name));
            }
            let settings = FlowSettings {
                event_capacity: self.inner.config.event_capacity,
                start_paused: status == KappaStatus::Paused,
            };
            let flow = FlowHandle::spawn_with(name.clone(), source, view, options, settings);
            // Subscribe before the flow can publish anything.
            self.forward_events(&flow);
            flows.insert(name.clone(), flow.clone());
            flow
        };

        info!("Flow {} added (version {})", name, flow.version());
        let _ = self.inner.events.send(KappaEvent::FlowAdded { name });

        if self.inner.config.autostart && status == KappaStatus::Running {
            flow.start();
        }
        Ok(flow)
    }

    fn forward_events(&self, flow: &FlowHandle) {
        let mut events = flow.subscribe();
        let sink = self.inner.events.clone();
        let name = flow.name().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = sink.send(KappaEvent::from_flow(&name, event));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder for flow {} lagged, skipped {} events", name, skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!(flow = %name, "flow event stream closed");
                        break;
                    }
                }
            }
        });
    }

    /// Resolve names to flows. `None` selects every flow in insertion order.
    fn select(&self, names: Option<&[&str]>) -> Result<Vec<FlowHandle>> {
        let flows = self.inner.flows.read();
        match names {
            None => Ok(flows.values().cloned().collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    flows
                        .get(*name)
                        .cloned()
                        .ok_or_else(|| KappaError::UnknownFlow(name.to_string()))
                })
                .collect(),
        }
    }

    pub fn flow(&self, name: &str) -> Option<FlowHandle> {
        self.inner.flows.read().get(name).cloned()
    }

    pub fn flow_names(&self) -> Vec<String> {
        self.inner.flows.read().keys().cloned().collect()
    }

    fn require(&self, name: &str) -> Result<FlowHandle> {
        self.flow(name)
            .ok_or_else(|| KappaError::UnknownFlow(name.to_string()))
    }

    pub fn get_state(&self, name: &str) -> Result<FlowState> {
        Ok(self.require(name)?.get_state())
    }

    /// Events of every flow, published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<KappaEvent> {
        self.inner.events.subscribe()
    }

    /// Api of the named flow's view. Always includes `ready`.
    pub fn view(&self, name: &str) -> Result<BoundApi> {
        let flow = self.require(name)?;
        let api = flow.view_api();
        Ok(BoundApi::new(
            name,
            api,
            ApiContext {
                kappa: self.clone(),
                flow,
            },
        ))
    }

    /// Api of the named flow's source.
    pub fn source(&self, name: &str) -> Result<BoundApi> {
        let flow = self.require(name)?;
        let api = flow.source_api();
        Ok(BoundApi::new(
            name,
            api,
            ApiContext {
                kappa: self.clone(),
                flow,
            },
        ))
    }

    pub async fn ready(&self, names: Option<&[&str]>) -> Result<()> {
        let flows = self.select(names)?;
        join_flows(&flows, |flow| async move { flow.ready().await }).await
    }

    /// Pause the selected flows. `None` also pauses the orchestrator, so
    /// flows added later start paused.
    pub async fn pause(&self, names: Option<&[&str]>) -> Result<()> {
        let flows = self.select(names)?;
        if names.is_none() {
            self.set_status(KappaStatus::Paused);
        }
        join_flows(&flows, |flow| async move { flow.pause().await }).await
    }

    pub async fn resume(&self, names: Option<&[&str]>) -> Result<()> {
        let flows = self.select(names)?;
        if names.is_none() {
            self.set_status(KappaStatus::Running);
        }
        join_flows(&flows, |flow| async move { flow.resume().await }).await
    }

    pub async fn reset(&self, names: Option<&[&str]>) -> Result<()> {
        let flows = self.select(names)?;
        join_flows(&flows, |flow| async move { flow.reset().await }).await
    }

    /// Close every flow.
    pub async fn close(&self) -> Result<()> {
        self.set_status(KappaStatus::Closed);
        let flows = self.select(None)?;
        info!("Closing {} flows", flows.len());
        join_flows(&flows, |flow| async move { flow.close().await }).await
    }

    fn set_status(&self, status: KappaStatus) {
        let mut current = self.inner.status.write();
        if *current != KappaStatus::Closed {
            *current = status;
        }
    }
}

impl Default for Kappa {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Kappa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kappa")
            .field("status", &self.status())
            .field("flows", &self.flow_names())
            .finish()
    }
}

/// Run `op` on every flow concurrently and return the first error once all
/// of them finished. An empty selection completes immediately.
async fn join_flows<F, Fut>(flows: &[FlowHandle], op: F) -> Result<()>
where
    F: Fn(FlowHandle) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let results = join_all(flows.iter().cloned().map(op)).await;
    results.into_iter().collect()
}
