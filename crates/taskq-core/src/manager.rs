//! The queue manager -- mediates between the durable metadata store
//! (`taskq_db`) and the in-memory broker (`taskq_broker`).
//!
//! Each public method corresponds to one operation named in the spec:
//! `enqueue`, `claim_next`, `complete`, `fail`, `promote_delayed`,
//! `reclaim_stale`. Wraps the underlying state machine with
//! semantically-named convenience functions the rest of the codebase calls
//! instead of reaching for raw transitions.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use uuid::Uuid;

use taskq_broker::{Broker, Claim};
use taskq_db::models::{Priority, Task, TaskStatus};
use taskq_db::queries::tasks::{self, FailureOutcome, NewTask};

use crate::backoff::backoff_secs;
use crate::clock::Clock;

/// Errors surfaced by the queue manager. Infra errors (db/broker) are
/// wrapped rather than flattened into `anyhow` so callers like the worker
/// pool supervisor can decide to retry in place versus exit the process.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
    #[error("broker error: {0}")]
    Broker(#[from] taskq_broker::BrokerError),
    #[error("task {0} not found")]
    NotFound(Uuid),
}

/// Arguments for enqueueing a new task, as accepted from a producer.
pub struct EnqueueRequest {
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub priority: Priority,
    pub max_retries: i32,
    pub retry_delay_secs: i64,
    pub timeout_secs: i64,
    pub queue_name: String,
}

/// A task claimed from the broker and durably marked `processing`,
/// ready for a worker to dispatch.
pub struct ClaimedTask {
    pub task: Task,
}

pub struct QueueManager {
    db: PgPool,
    broker: Arc<Broker>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    pub fn new(db: PgPool, broker: Arc<Broker>, clock: Arc<dyn Clock>) -> Self {
        Self { db, broker, clock }
    }

    /// Durably insert the task, then make it visible to workers by pushing
    /// its id onto the broker's pending list. The durable insert happens
    /// first: if the broker push fails, the task still exists and a later
    /// `reclaim_stale`-style sweep (or an operator retry) can pick it up,
    /// whereas the reverse order could make a task claimable before it is
    /// even durably recorded.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<Task, ManagerError> {
        let task = tasks::insert_task(
            &self.db,
            NewTask {
                task_name: req.task_name,
                args: req.args,
                kwargs: req.kwargs,
                priority: req.priority,
                max_retries: req.max_retries,
                retry_delay_secs: req.retry_delay_secs,
                timeout_secs: req.timeout_secs,
                queue_name: req.queue_name.clone(),
            },
        )
        .await?;

        self.broker
            .push_pending(&req.queue_name, &task.id.to_string(), task.priority.as_i16())
            .await?;

        Ok(task)
    }

    /// Pop the next claimable task from the broker and transition its
    /// durable record from `pending` to `processing`.
    ///
    /// If the broker handed back a task id whose durable record is no
    /// longer `pending` (a crash-recovery race with `reclaim_stale`), the
    /// claim is dropped and `Ok(None)` is returned -- the caller should
    /// poll again rather than treat this as an error.
    pub async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        claim_ttl: ChronoDuration,
    ) -> Result<Option<ClaimedTask>, ManagerError> {
        let now = self.clock.now();
        let claim: Option<Claim> = self
            .broker
            .claim_next(queue_name, worker_id, now + claim_ttl)
            .await?;

        let Some(claim) = claim else {
            return Ok(None);
        };

        let task_id: Uuid = claim
            .task_id
            .parse()
            .map_err(|_| ManagerError::NotFound(Uuid::nil()))?;

        match tasks::claim_task(&self.db, task_id, now).await? {
            Some(task) => Ok(Some(ClaimedTask { task })),
            None => {
                // Lost the race to a crash-recovery reclaim; drop the
                // broker's now-stale claim and let the caller poll again.
                self.broker.ack(queue_name, &claim.task_id).await?;
                Ok(None)
            }
        }
    }

    /// Mark a claimed task as successfully completed.
    pub async fn complete(
        &self,
        task: &Task,
        result: serde_json::Value,
    ) -> Result<(), ManagerError> {
        let now = self.clock.now();
        let committed = tasks::complete_task(&self.db, task.id, result, now).await?;
        if !committed {
            return Err(ManagerError::NotFound(task.id));
        }
        self.broker.ack(&task.queue_name, &task.id.to_string()).await?;
        Ok(())
    }

    /// Record a failed attempt. Retries if `task.retry_count + 1 <=
    /// task.max_retries`, using exponential backoff from
    /// `task.retry_delay_secs`; otherwise the task becomes terminally
    /// `failed`.
    pub async fn fail(&self, task: &Task, error_message: &str) -> Result<(), ManagerError> {
        let now = self.clock.now();
        let next_attempt = task.retry_count + 1;

        let outcome = if next_attempt <= task.max_retries {
            let delay = backoff_secs(next_attempt as u32, task.retry_delay_secs);
            FailureOutcome::Retry {
                next_retry_at: now + ChronoDuration::seconds(delay),
            }
        } else {
            FailureOutcome::Exhausted
        };

        let committed =
            tasks::fail_task(&self.db, task.id, error_message, outcome, now).await?;
        if !committed {
            return Err(ManagerError::NotFound(task.id));
        }
        self.broker.ack(&task.queue_name, &task.id.to_string()).await?;
        Ok(())
    }

    /// Route a claimed task straight to terminal `failed` because its
    /// handler could not be resolved. `retry_count` is forced to
    /// `max_retries` since the task never actually executed and is not
    /// eligible for a future attempt.
    pub async fn fail_unknown(&self, task: &Task, error_message: &str) -> Result<(), ManagerError> {
        let now = self.clock.now();
        let committed = tasks::force_fail_task(&self.db, task.id, error_message, now).await?;
        if !committed {
            return Err(ManagerError::NotFound(task.id));
        }
        self.broker.ack(&task.queue_name, &task.id.to_string()).await?;
        Ok(())
    }

    /// Move every due `retry` task in `queue_name` back to `pending` and
    /// re-push it onto the broker. Idempotent: a task already promoted by
    /// a concurrent call is simply skipped.
    pub async fn promote_delayed(&self, queue_name: &str) -> Result<usize, ManagerError> {
        let now = self.clock.now();
        let due = tasks::list_due_retries(&self.db, now).await?;
        let mut promoted = 0;

        for task in due {
            if task.queue_name != queue_name {
                continue;
            }
            if tasks::promote_retry_to_pending(&self.db, task.id, now).await? {
                self.broker
                    .push_pending(queue_name, &task.id.to_string(), task.priority.as_i16())
                    .await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Crash recovery: find tasks stuck in `processing` whose broker
    /// inflight marker has expired (their worker is presumed dead) and
    /// route each one through `fail` as a failed attempt, so it charges a
    /// retry (or goes terminally FAILED once retries are exhausted) the
    /// same as any other handler failure.
    pub async fn reclaim_stale(
        &self,
        queue_name: &str,
        processing_timeout: ChronoDuration,
    ) -> Result<usize, ManagerError> {
        let now = self.clock.now();
        // The durable `started_at` timeout is authoritative for recovery;
        // the broker's own expired-inflight list is consulted only to
        // clear markers left behind by tasks reclaimed this way.
        let _ = self.broker.list_expired_inflight(queue_name, now).await?;
        let stale_in_db = tasks::list_stale_processing(&self.db, queue_name, now - processing_timeout)
            .await?;

        let mut reclaimed = 0;
        for task in stale_in_db {
            self.fail(&task, "reclaimed: processing timed out, worker presumed dead")
                .await?;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}
