//! The registry of task handlers this binary knows how to run.
//!
//! Handlers are registered here at compile time -- dynamic handler loading
//! is out of scope, so extending the set of runnable tasks means adding a
//! `register` call and rebuilding.

use std::sync::Arc;

use taskq_core::registry::{HandlerOptions, TaskArgs, TaskRegistry};

/// Build the registry this process runs against.
pub fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry
        .register("noop", Arc::new(noop), HandlerOptions::default())
        .expect("noop should register exactly once");

    registry
        .register("echo", Arc::new(echo), HandlerOptions::default())
        .expect("echo should register exactly once");

    registry
}

fn noop(
    _args: TaskArgs,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = taskq_core::registry::HandlerResult> + Send>> {
    Box::pin(async { Ok(serde_json::Value::Null) })
}

fn echo(
    args: TaskArgs,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = taskq_core::registry::HandlerResult> + Send>> {
    Box::pin(async move { Ok(serde_json::Value::Array(args.args)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_builtin_handlers() {
        let registry = build_registry();
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["echo", "noop"]);
    }
}
