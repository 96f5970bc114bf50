//! Step business logic is plugged in through [`TaskHandler`] trait objects,
//! looked up by the `handler` name each step declares.

use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Executes one task. Must tolerate being run more than once with the same
/// input: delivery is at-least-once.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    /// `Ok(output)` completes the task; `Err` counts as a failed attempt
    async fn handle(&self, input: serde_json::Value) -> Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn handle(&self, input: serde_json::Value) -> Result<serde_json::Value> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Name -> handler lookup used by workers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the [`builtin`] handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.register(name, handler_fn(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Handlers available without any user code
pub mod builtin {
    use super::HandlerRegistry;

    pub const IDENTITY: &str = "identity";
    pub const NOOP: &str = "noop";

    pub fn register_all(registry: &mut HandlerRegistry) {
        registry
            .register_fn(IDENTITY, |input| async move { Ok(input) })
            .register_fn(NOOP, |_| async { Ok(serde_json::Value::Null) });
    }
}
