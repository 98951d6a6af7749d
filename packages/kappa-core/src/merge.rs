//! Fan-in source: presents a growing set of named child sources as one.
//!
//! Children with unconsumed updates sit in a dirty set. A pull drains the
//! set, pulls every dirty child concurrently and concatenates their batches;
//! the merged commit runs each child's own commit, so every child cursor
//! moves independently of the others. Children of a round that never
//! committed are pulled again on the next round.

use crate::cursor::CursorState;
use crate::message::{Batch, IndexingProgress, Message};
use crate::source::{FlowContext, Source, SourceCapabilities, UpdateNotifier};
use anyhow::Context;
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
struct Child {
    source: Arc<dyn Source>,
    caps: SourceCapabilities,
}

type DirtySet = Arc<Mutex<IndexSet<String>>>;

pub struct MergeSource {
    children: RwLock<IndexMap<String, Child>>,
    dirty: DirtySet,
    /// Children pulled by the last round, cleared once that round commits
    in_flight: DirtySet,
    /// Last progress reported by each child
    progress: Arc<Mutex<IndexMap<String, IndexingProgress>>>,
    context: RwLock<Option<FlowContext>>,
    state: Option<CursorState>,
}

impl MergeSource {
    pub fn new() -> Self {
        Self {
            children: RwLock::new(IndexMap::new()),
            dirty: Arc::new(Mutex::new(IndexSet::new())),
            in_flight: Arc::new(Mutex::new(IndexSet::new())),
            progress: Arc::new(Mutex::new(IndexMap::new())),
            context: RwLock::new(None),
            state: None,
        }
    }

    /// Versioned merge source; the view version is kept in `state`.
    pub fn with_state(state: CursorState) -> Self {
        Self {
            state: Some(state),
            ..Self::new()
        }
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.children.read().get(name).map(|c| c.source.clone())
    }

    /// Names of children with pending updates.
    pub fn dirty(&self) -> Vec<String> {
        self.dirty.lock().iter().cloned().collect()
    }

    /// Add a child. Duplicate names are ignored.
    ///
    /// If the merge source is already open the child is opened right away and
    /// queued for the next pull.
    pub async fn add_source(&self, name: impl Into<String>, source: Arc<dyn Source>) -> anyhow::Result<()> {
        let name = name.into();
        let child = Child {
            caps: source.capabilities(),
            source,
        };
        {
            let mut children = self.children.write();
            if children.contains_key(&name) {
                debug!(child = %name, "merge child already registered");
                return Ok(());
            }
            children.insert(name.clone(), child.clone());
        }

        let ctx = self.context.read().clone();
        if let Some(ctx) = ctx {
            if let Err(e) = self.open_child(&ctx, &name, &child).await {
                self.children.write().shift_remove(&name);
                return Err(e);
            }
            info!("Merge source {} added child {}", ctx.name, name);
            self.dirty.lock().insert(name);
            ctx.update();
        } else {
            self.dirty.lock().insert(name);
        }
        Ok(())
    }

    async fn open_child(&self, ctx: &FlowContext, name: &str, child: &Child) -> anyhow::Result<()> {
        if !child.caps.open {
            return Ok(());
        }
        let dirty = self.dirty.clone();
        let parent = ctx.notifier();
        let child_name = name.to_string();
        let notifier = UpdateNotifier::new(move || {
            dirty.lock().insert(child_name.clone());
            parent.notify();
        });
        let child_ctx = FlowContext::new(format!("{}/{}", ctx.name, name), ctx.version, notifier);
        child
            .source
            .open(&child_ctx)
            .await
            .with_context(|| format!("open child source {}", name))
    }

    fn snapshot(&self) -> Vec<(String, Child)> {
        self.children
            .read()
            .iter()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect()
    }

    fn mark_all_dirty(&self) {
        let names = self.child_names();
        self.dirty.lock().extend(names);
    }
}

impl Default for MergeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for MergeSource {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            open: true,
            reset: true,
            versioned: self.state.is_some(),
            close: true,
            ..Default::default()
        }
    }

    async fn open(&self, ctx: &FlowContext) -> anyhow::Result<()> {
        *self.context.write() = Some(ctx.clone());
        let children = self.snapshot();
        try_join_all(
            children
                .iter()
                .map(|(name, child)| self.open_child(ctx, name, child)),
        )
        .await?;
        self.mark_all_dirty();
        Ok(())
    }

    async fn pull(&self) -> anyhow::Result<Option<Batch>> {
        let pending: Vec<(String, Arc<dyn Source>)> = {
            let mut dirty = self.dirty.lock();
            let uncommitted: Vec<String> = self.in_flight.lock().drain(..).collect();
            if !uncommitted.is_empty() {
                debug!(children = ?uncommitted, "re-pulling uncommitted merge children");
                dirty.extend(uncommitted);
            }
            if dirty.is_empty() {
                return Ok(None);
            }
            let children = self.children.read();
            dirty
                .drain(..)
                .filter_map(|name| {
                    let source = children.get(&name)?.source.clone();
                    Some((name, source))
                })
                .collect()
        };

        let results = join_all(pending.iter().map(|(_, source)| source.pull())).await;

        let mut messages: Vec<Message> = Vec::new();
        let mut commits = Vec::new();
        let mut unfinished = Vec::new();
        let mut pulled = Vec::new();
        let mut failure = None;
        for ((name, _), result) in pending.iter().zip(results) {
            match result {
                Ok(Some(batch)) => {
                    pulled.push(name.clone());
                    if !batch.finished {
                        unfinished.push(name.clone());
                    }
                    messages.extend(batch.messages);
                    if let Some(commit) = batch.on_indexed {
                        commits.push((name.clone(), commit));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e.context(format!("pull child source {}", name)));
                    }
                }
            }
        }

        if let Some(err) = failure {
            // Nothing from this round is committed, so every pulled child
            // still has its backlog.
            self.dirty
                .lock()
                .extend(pending.into_iter().map(|(name, _)| name));
            return Err(err);
        }

        let finished = {
            let mut dirty = self.dirty.lock();
            dirty.extend(unfinished);
            dirty.is_empty()
        };

        if messages.is_empty() && commits.is_empty() {
            if finished {
                return Ok(None);
            }
            return Ok(Some(Batch::new(Vec::new()).finished(false)));
        }

        self.in_flight.lock().extend(pulled.iter().cloned());

        let progress = self.progress.clone();
        let in_flight = self.in_flight.clone();
        Ok(Some(Batch::new(messages).finished(finished).on_indexed(
            move || async move {
                let contributed: HashSet<String> =
                    commits.iter().map(|(name, _)| name.clone()).collect();
                let reported = try_join_all(commits.into_iter().map(|(name, commit)| async move {
                    let progress = commit()
                        .await
                        .with_context(|| format!("commit child source {}", name))?;
                    Ok::<_, anyhow::Error>((name, progress))
                }))
                .await?;

                {
                    let mut in_flight = in_flight.lock();
                    for name in &pulled {
                        in_flight.shift_remove(name);
                    }
                }

                let mut progress = progress.lock();
                let mut any = false;
                for (name, child_progress) in reported {
                    if let Some(child_progress) = child_progress {
                        progress.insert(name, child_progress);
                        any = true;
                    }
                }
                if !any {
                    return Ok(None);
                }

                // Children that did not contribute were already indexed up to
                // their last report.
                let mut merged = IndexingProgress::default();
                for (name, p) in progress.iter() {
                    if contributed.contains(name) {
                        merged.merge(p);
                    } else {
                        merged.merge(&IndexingProgress::new(
                            p.total_blocks,
                            p.indexed_blocks,
                            p.indexed_blocks,
                        ));
                    }
                }
                Ok(Some(merged))
            },
        )))
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let children = self.snapshot();
        try_join_all(children.iter().filter(|(_, c)| c.caps.reset).map(|(name, child)| async move {
            child
                .source
                .reset()
                .await
                .with_context(|| format!("reset child source {}", name))
        }))
        .await?;
        self.progress.lock().clear();
        self.in_flight.lock().clear();
        self.mark_all_dirty();
        Ok(())
    }

    async fn fetch_version(&self) -> anyhow::Result<Option<u32>> {
        match &self.state {
            Some(state) => Ok(state.fetch_version().await?),
            None => Ok(None),
        }
    }

    async fn store_version(&self, version: u32) -> anyhow::Result<()> {
        if let Some(state) = &self.state {
            state.store_version(version).await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let children = self.snapshot();
        try_join_all(children.iter().filter(|(_, c)| c.caps.close).map(|(name, child)| async move {
            child
                .source
                .close()
                .await
                .with_context(|| format!("close child source {}", name))
        }))
        .await?;
        *self.context.write() = None;
        Ok(())
    }
}
