//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Priority, Task, TaskStatus};

/// Arguments for inserting a new task. Mirrors the producer-facing fields;
/// server-generated columns (id, status, timestamps, retry_count) are
/// filled in by the database.
pub struct NewTask {
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub priority: Priority,
    pub max_retries: i32,
    pub retry_delay_secs: i64,
    pub timeout_secs: i64,
    pub queue_name: String,
}

/// Insert a new task row in `pending` status.
pub async fn insert_task(pool: &PgPool, new: NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (task_name, args, kwargs, priority, status, retry_count, max_retries, \
             retry_delay_secs, timeout_secs, queue_name) \
         VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_name)
    .bind(new.args)
    .bind(new.kwargs)
    .bind(new.priority)
    .bind(new.max_retries)
    .bind(new.retry_delay_secs)
    .bind(new.timeout_secs)
    .bind(new.queue_name)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a task by its ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks in a queue, optionally filtered by status, newest first.
pub async fn list_tasks(
    pool: &PgPool,
    queue_name: &str,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE queue_name = $1 AND status = $2 \
                 ORDER BY created_at DESC",
            )
            .bind(queue_name)
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE queue_name = $1 ORDER BY created_at DESC",
            )
            .bind(queue_name)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Transition a task from `pending` to `processing`, recording the start
/// time. Optimistically locked on the expected current status.
///
/// Returns `Ok(None)` if the task was not found or was not in `pending`
/// status (i.e. another worker already claimed it).
pub async fn claim_task(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'processing', started_at = $2, updated_at = $2 \
         WHERE id = $1 AND status = 'pending' \
         RETURNING *",
    )
    .bind(id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to claim task")?;

    Ok(task)
}

/// Transition a task from `processing` to `success`, recording the result
/// and completion time.
///
/// Returns `Ok(false)` if the task was not in `processing` status.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    result: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'success', result = $2, completed_at = $3, updated_at = $3 \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(result)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to complete task")?
    .rows_affected();

    Ok(rows > 0)
}

/// Outcome of a failed attempt, decided by the caller from
/// `retry_count`/`max_retries` before this function is invoked.
pub enum FailureOutcome {
    /// Attempts remain: move to `retry` with a computed `next_retry_at`.
    Retry { next_retry_at: DateTime<Utc> },
    /// Attempts exhausted: move to the terminal `failed` status.
    Exhausted,
}

/// Record a failed attempt: increment `retry_count`, store the error
/// message, and transition to either `retry` or `failed` depending on
/// `outcome`.
///
/// Returns `Ok(false)` if the task was not in `processing` status.
pub async fn fail_task(
    pool: &PgPool,
    id: Uuid,
    error_message: &str,
    outcome: FailureOutcome,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = match outcome {
        FailureOutcome::Retry { next_retry_at } => {
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'retry', error_message = $2, retry_count = retry_count + 1, \
                     next_retry_at = $3, updated_at = $4 \
                 WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(error_message)
            .bind(next_retry_at)
            .bind(now)
            .execute(pool)
            .await
        }
        FailureOutcome::Exhausted => {
            // retry_count already reflects every attempt charged by prior
            // Retry transitions; this final attempt is terminal and does
            // not get its own increment, or retry_count would overshoot
            // max_retries.
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'failed', error_message = $2, \
                     completed_at = $3, updated_at = $3 \
                 WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(error_message)
            .bind(now)
            .execute(pool)
            .await
        }
    }
    .context("failed to record task failure")?
    .rows_affected();

    Ok(rows > 0)
}

/// Force a task directly to the terminal `failed` status with
/// `retry_count` set to its own `max_retries`, bypassing the normal
/// attempt-counting path. Used when a task is rejected before it ever
/// runs (e.g. an unknown task name), so it must not be eligible for a
/// future attempt.
///
/// Returns `Ok(false)` if the task was not in `processing` status.
pub async fn force_fail_task(
    pool: &PgPool,
    id: Uuid,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error_message = $2, retry_count = max_retries, \
             completed_at = $3, updated_at = $3 \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(error_message)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to force-fail task")?
    .rows_affected();

    Ok(rows > 0)
}

/// List tasks in `retry` status whose `next_retry_at` has passed, across
/// every queue. The queue manager's `promote_delayed` operation transitions
/// each of these back to `pending` and re-pushes it onto the broker.
pub async fn list_due_retries(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'retry' AND next_retry_at <= $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list due retries")?;

    Ok(tasks)
}

/// Transition a single task from `retry` to `pending`. Idempotent: calling
/// this twice on an already-pending task is a no-op (`Ok(false)`).
pub async fn promote_retry_to_pending(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE tasks SET status = 'pending', updated_at = $2 \
         WHERE id = $1 AND status = 'retry'",
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to promote retry task to pending")?
    .rows_affected();

    Ok(rows > 0)
}

/// List tasks stuck in `processing` for longer than `stale_after`. Used by
/// `reclaim_stale` crash recovery: the broker's inflight marker expired (the
/// worker holding it died) but the durable record never transitioned out of
/// `processing`.
pub async fn list_stale_processing(
    pool: &PgPool,
    queue_name: &str,
    older_than: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE queue_name = $1 AND status = 'processing' AND started_at <= $2",
    )
    .bind(queue_name)
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to list stale processing tasks")?;

    Ok(tasks)
}
