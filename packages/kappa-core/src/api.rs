//! Named functions that sources and views expose through the orchestrator.
//!
//! Every function receives an [`ApiContext`] as its first argument instead of
//! being bound to a receiver. Arguments and results are JSON values.

use crate::error::{KappaError, Result};
use crate::flow::FlowHandle;
use crate::kappa::Kappa;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub type ApiFn = Arc<dyn Fn(ApiContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Context passed to every api function.
#[derive(Clone)]
pub struct ApiContext {
    pub kappa: Kappa,
    pub flow: FlowHandle,
}

/// Ordered set of named api functions.
#[derive(Clone, Default)]
pub struct Api {
    functions: IndexMap<String, ApiFn>,
}

impl Api {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ApiContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name, f);
        self
    }

    pub fn insert<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(ApiContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f: ApiFn = Arc::new(move |ctx, args| Box::pin(f(ctx, args)));
        self.functions.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<&ApiFn> {
        self.functions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// View api as exposed by a flow: `ready` always delegates to the flow.
    pub(crate) fn with_ready(mut self) -> Self {
        self.insert("ready", |ctx: ApiContext, _args| async move {
            ctx.flow.ready().await?;
            Ok(Value::Null)
        });
        self
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

/// An [`Api`] bound to the flow it belongs to.
#[derive(Clone)]
pub struct BoundApi {
    namespace: String,
    api: Api,
    ctx: ApiContext,
}

impl BoundApi {
    pub(crate) fn new(namespace: impl Into<String>, api: Api, ctx: ApiContext) -> Self {
        Self {
            namespace: namespace.into(),
            api,
            ctx,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn names(&self) -> Vec<&str> {
        self.api.names()
    }

    pub async fn call(&self, function: &str, args: Value) -> Result<Value> {
        let f = self
            .api
            .get(function)
            .ok_or_else(|| KappaError::UnknownApi {
                namespace: self.namespace.clone(),
                function: function.to_string(),
            })?;

        f(self.ctx.clone(), args)
            .await
            .map_err(|e| KappaError::Api(format!("{}.{}: {:#}", self.namespace, function, e)))
    }

    /// Resolves once the owning flow has caught up.
    pub async fn ready(&self) -> Result<()> {
        self.ctx.flow.ready().await
    }
}

impl fmt::Debug for BoundApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundApi")
            .field("namespace", &self.namespace)
            .field("functions", &self.api)
            .finish()
    }
}
