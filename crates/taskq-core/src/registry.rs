//! Task registry -- a process-wide name-to-handler mapping.
//!
//! The queue manager and worker never execute code directly; they resolve a
//! task's `task_name` through the registry first. A task whose name has no
//! registered handler fails immediately as [`UnknownTask`], without
//! consuming a retry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Positional and keyword arguments passed to a handler, exactly as stored
/// on the task record.
#[derive(Debug, Clone)]
pub struct TaskArgs {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// A handler's outcome: `Ok` carries the JSON result persisted on the task
/// record, `Err` carries the message recorded as `error_message`.
pub type HandlerResult = Result<serde_json::Value, String>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered task handler.
pub type Handler = Arc<dyn Fn(TaskArgs) -> HandlerFuture + Send + Sync>;

/// Registration-time hints a handler can supply as defaults for producers
/// that omit them on `enqueue`.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub default_max_retries: i32,
    pub default_timeout_secs: i64,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_timeout_secs: 300,
        }
    }
}

struct HandlerEntry {
    handler: Handler,
    options: HandlerOptions,
}

/// Error returned when registering a name that is already taken by a
/// different handler.
#[derive(Debug, thiserror::Error)]
#[error("task name {0:?} is already registered")]
pub struct RegistryConflict(pub String);

/// Error returned when resolving a task name with no registered handler.
#[derive(Debug, thiserror::Error)]
#[error("no handler registered for task {0:?}")]
pub struct UnknownTask(pub String);

/// A process-wide collection of registered task handlers, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Re-registering the same name is a
    /// [`RegistryConflict`] -- the registry does not allow a second handler
    /// to silently replace the first.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Handler,
        options: HandlerOptions,
    ) -> Result<(), RegistryConflict> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryConflict(name));
        }
        self.handlers.insert(name, HandlerEntry { handler, options });
        Ok(())
    }

    /// Resolve a handler by name.
    pub fn resolve(&self, name: &str) -> Result<(Handler, HandlerOptions), UnknownTask> {
        self.handlers
            .get(name)
            .map(|entry| (entry.handler.clone(), entry.options))
            .ok_or_else(|| UnknownTask(name.to_owned()))
    }

    /// List the names of all registered task handlers.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Handler {
        Arc::new(|_args| Box::pin(async { Ok(serde_json::Value::Null) }))
    }

    #[test]
    fn registry_starts_empty() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = TaskRegistry::new();
        registry
            .register("send_email", noop_handler(), HandlerOptions::default())
            .unwrap();

        let resolved = registry.resolve("send_email");
        assert!(resolved.is_ok());
    }

    #[test]
    fn register_conflict_on_duplicate_name() {
        let mut registry = TaskRegistry::new();
        registry
            .register("send_email", noop_handler(), HandlerOptions::default())
            .unwrap();

        let err = registry
            .register("send_email", noop_handler(), HandlerOptions::default())
            .unwrap_err();
        assert_eq!(err.0, "send_email");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_missing_returns_unknown_task() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("nonexistent").unwrap_err();
        assert_eq!(err.0, "nonexistent");
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = TaskRegistry::new();
        registry
            .register("alpha", noop_handler(), HandlerOptions::default())
            .unwrap();
        registry
            .register("beta", noop_handler(), HandlerOptions::default())
            .unwrap();

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = TaskRegistry::new();
        registry
            .register("send_email", noop_handler(), HandlerOptions::default())
            .unwrap();
        let debug = format!("{registry:?}");
        assert!(debug.contains("send_email"));
    }

    #[tokio::test]
    async fn resolved_handler_runs() {
        let mut registry = TaskRegistry::new();
        registry
            .register(
                "echo",
                Arc::new(|args: TaskArgs| {
                    Box::pin(async move { Ok(serde_json::Value::Array(args.args)) })
                }),
                HandlerOptions::default(),
            )
            .unwrap();

        let (handler, _opts) = registry.resolve("echo").unwrap();
        let result = handler(TaskArgs {
            args: vec![serde_json::json!(1)],
            kwargs: Default::default(),
        })
        .await;
        assert_eq!(result, Ok(serde_json::json!([1])));
    }
}
