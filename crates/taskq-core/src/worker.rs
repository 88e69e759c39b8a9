//! A single worker: claim a task, dispatch it to the registered handler
//! under a timeout, classify the outcome, and report it back to the queue
//! manager.
//!
//! Claim, start, run under `tokio::time::timeout`, classify, commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use crate::manager::{ManagerError, QueueManager};
use crate::registry::{TaskArgs, TaskRegistry};

/// Outcome of a single claim-dispatch-classify cycle, useful to callers
/// (the pool supervisor) deciding whether to keep looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No task was available to claim.
    Idle,
    /// A task ran to completion, successfully or not.
    Ran,
}

pub struct Worker {
    pub worker_id: String,
    pub queue_name: String,
    manager: Arc<QueueManager>,
    registry: Arc<TaskRegistry>,
}

impl Worker {
    pub fn new(
        worker_id: String,
        queue_name: String,
        manager: Arc<QueueManager>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            worker_id,
            queue_name,
            manager,
            registry,
        }
    }

    /// Try to claim one task and run it to completion. Returns
    /// `CycleOutcome::Idle` when the broker had nothing pending.
    pub async fn run_once(&self) -> Result<CycleOutcome, ManagerError> {
        // The claim TTL bounds how long the broker's inflight marker is
        // honored before a maintenance sweep may reclaim it; it should
        // comfortably exceed the task's own timeout.
        let claim_ttl = ChronoDuration::seconds(3600);

        let Some(claimed) = self
            .manager
            .claim_next(&self.queue_name, &self.worker_id, claim_ttl)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        let task = claimed.task;
        info!(task_id = %task.id, task_name = %task.task_name, worker = %self.worker_id, "claimed task");

        let resolved = self.registry.resolve(&task.task_name);
        let (handler, _opts) = match resolved {
            Ok(pair) => pair,
            Err(unknown) => {
                warn!(task_id = %task.id, task_name = %unknown.0, "unknown task, failing without retry");
                self.manager
                    .fail_unknown(&task, &format!("unknown task: {}", unknown.0))
                    .await?;
                return Ok(CycleOutcome::Ran);
            }
        };

        let args = TaskArgs {
            args: task
                .args
                .as_array()
                .cloned()
                .unwrap_or_default(),
            kwargs: task
                .kwargs
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };

        let timeout = Duration::from_secs(task.timeout_secs.max(0) as u64);
        let outcome = tokio::time::timeout(timeout, handler(args)).await;

        match outcome {
            Ok(Ok(result)) => {
                info!(task_id = %task.id, "task succeeded");
                self.manager.complete(&task, result).await?;
            }
            Ok(Err(message)) => {
                warn!(task_id = %task.id, error = %message, "task handler returned an error");
                self.manager.fail(&task, &message).await?;
            }
            Err(_elapsed) => {
                warn!(task_id = %task.id, timeout_secs = task.timeout_secs, "task timed out");
                self.manager.fail(&task, "timeout").await?;
            }
        }

        Ok(CycleOutcome::Ran)
    }
}
