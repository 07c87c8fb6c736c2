//! Named handler registries for orchestrations and activities.
//!
//! Handlers are looked up by name at dispatch time; an unregistered name is
//! not an error at registration time, it fails the instance (or activity)
//! that asked for it. Registries are immutable once built.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::OrchestrationContext;

/// Execution-scoped handle passed to every activity invocation.
pub struct ActivityContext {
    pub instance: String,
    pub name: String,
}

impl ActivityContext {
    pub fn trace_info(&self, message: impl AsRef<str>) {
        info!(instance = %self.instance, activity = %self.name, "{}", message.as_ref());
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        warn!(instance = %self.instance, activity = %self.name, "{}", message.as_ref());
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        error!(instance = %self.instance, activity = %self.name, "{}", message.as_ref());
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Wraps a plain async closure as an [`ActivityHandler`].
pub struct FnActivity<F>(pub F)
where
    F: Fn(ActivityContext, String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync;

#[async_trait]
impl<F> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Wraps a plain async closure as an [`OrchestrationHandler`].
pub struct FnOrchestration<F>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync;

#[async_trait]
impl<F> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct ActivityRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let wrapped = move |ctx: ActivityContext, input: String| {
            Box::pin(f(ctx, input)) as Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        };
        self.handlers.insert(name.into(), Arc::new(FnActivity(wrapped)));
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry { handlers: self.handlers }
    }
}

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
    /// Fire-and-forget successors: when `from` completes successfully, the
    /// runtime starts `to` with the predecessor's output as input.
    successors: HashMap<String, String>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn successor_of(&self, name: &str) -> Option<&str> {
        self.successors.get(name).map(String::as_str)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct OrchestrationRegistryBuilder {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
    successors: HashMap<String, String>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let wrapped = move |ctx: OrchestrationContext, input: String| {
            Box::pin(f(ctx, input)) as Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        };
        self.handlers.insert(name.into(), Arc::new(FnOrchestration(wrapped)));
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn OrchestrationHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Declare that a successful `from` run is followed by a fresh `to` run
    /// fed with `from`'s output. Failure and termination do not chain.
    pub fn chain(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.successors.insert(from.into(), to.into());
        self
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            handlers: self.handlers,
            successors: self.successors,
        }
    }
}
