//! Integration tests for the `tasks` query module.

use chrono::{Duration as ChronoDuration, Utc};

use taskq_db::models::{Priority, TaskStatus};
use taskq_db::queries::tasks::{self, FailureOutcome, NewTask};

use taskq_test_utils::{create_test_db, drop_test_db};

async fn setup() -> (sqlx::PgPool, String) {
    let (pool, db_name) = create_test_db().await;
    (pool, db_name)
}

fn sample_task(queue: &str) -> NewTask {
    NewTask {
        task_name: "send_email".to_owned(),
        args: serde_json::json!(["user@example.com"]),
        kwargs: serde_json::json!({}),
        priority: Priority::Normal,
        max_retries: 3,
        retry_delay_secs: 5,
        timeout_secs: 30,
        queue_name: queue.to_owned(),
    }
}

#[tokio::test]
async fn insert_and_get_round_trip() {
    let (db, db_name) = setup().await;

    let inserted = tasks::insert_task(&db, sample_task("default"))
        .await
        .expect("insert should succeed");
    assert_eq!(inserted.status, TaskStatus::Pending);
    assert_eq!(inserted.retry_count, 0);

    let fetched = tasks::get_task(&db, inserted.id)
        .await
        .expect("get should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, inserted.id);
    assert_eq!(fetched.task_name, "send_email");

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_is_exclusive() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let now = Utc::now();

    let first = tasks::claim_task(&db, task.id, now).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first.unwrap().status, TaskStatus::Processing);

    // A second claim attempt against the same (now processing) row fails.
    let second = tasks::claim_task(&db, task.id, now).await.unwrap();
    assert!(second.is_none());

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn complete_transitions_to_success() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let now = Utc::now();
    tasks::claim_task(&db, task.id, now).await.unwrap();

    let ok = tasks::complete_task(&db, task.id, serde_json::json!({"sent": true}), now)
        .await
        .unwrap();
    assert!(ok);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Success);
    assert!(fetched.completed_at.is_some());
    assert_eq!(fetched.result, Some(serde_json::json!({"sent": true})));

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fail_with_retry_sets_next_retry_at() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let now = Utc::now();
    tasks::claim_task(&db, task.id, now).await.unwrap();

    let next_retry_at = now + ChronoDuration::seconds(5);
    let ok = tasks::fail_task(
        &db,
        task.id,
        "connection refused",
        FailureOutcome::Retry { next_retry_at },
        now,
    )
    .await
    .unwrap();
    assert!(ok);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Retry);
    assert_eq!(fetched.retry_count, 1);
    assert_eq!(fetched.error_message.as_deref(), Some("connection refused"));
    assert!(fetched.next_retry_at.is_some());

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fail_exhausted_is_terminal() {
    let (db, db_name) = setup().await;

    let mut new_task = sample_task("default");
    new_task.max_retries = 2;
    let task = tasks::insert_task(&db, new_task).await.unwrap();
    let now = Utc::now();

    // Two retryable failures charge one attempt each; the third is
    // exhausted and must not charge a third.
    tasks::claim_task(&db, task.id, now).await.unwrap();
    tasks::fail_task(
        &db,
        task.id,
        "boom",
        FailureOutcome::Retry { next_retry_at: now },
        now,
    )
    .await
    .unwrap();
    tasks::promote_retry_to_pending(&db, task.id, now)
        .await
        .unwrap();

    tasks::claim_task(&db, task.id, now).await.unwrap();
    tasks::fail_task(
        &db,
        task.id,
        "boom",
        FailureOutcome::Retry { next_retry_at: now },
        now,
    )
    .await
    .unwrap();
    tasks::promote_retry_to_pending(&db, task.id, now)
        .await
        .unwrap();

    tasks::claim_task(&db, task.id, now).await.unwrap();
    let ok = tasks::fail_task(&db, task.id, "boom", FailureOutcome::Exhausted, now)
        .await
        .unwrap();
    assert!(ok);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Failed);
    assert!(fetched.completed_at.is_some());
    assert_eq!(fetched.retry_count, 2);
    assert_eq!(fetched.retry_count, fetched.max_retries);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn promote_retry_to_pending_is_idempotent() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let now = Utc::now();
    tasks::claim_task(&db, task.id, now).await.unwrap();
    tasks::fail_task(
        &db,
        task.id,
        "timeout",
        FailureOutcome::Retry {
            next_retry_at: now,
        },
        now,
    )
    .await
    .unwrap();

    let promoted = tasks::promote_retry_to_pending(&db, task.id, now)
        .await
        .unwrap();
    assert!(promoted);

    // Already pending: second call is a no-op.
    let promoted_again = tasks::promote_retry_to_pending(&db, task.id, now)
        .await
        .unwrap();
    assert!(!promoted_again);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_stale_processing_finds_tasks_past_the_deadline() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let started_at = Utc::now() - ChronoDuration::hours(1);
    tasks::claim_task(&db, task.id, started_at).await.unwrap();

    let stale = tasks::list_stale_processing(&db, "default", Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, task.id);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn force_fail_task_sets_retry_count_to_max_retries() {
    let (db, db_name) = setup().await;

    let task = tasks::insert_task(&db, sample_task("default"))
        .await
        .unwrap();
    let now = Utc::now();
    tasks::claim_task(&db, task.id, now).await.unwrap();

    let ok = tasks::force_fail_task(&db, task.id, "unknown task: nope", now)
        .await
        .unwrap();
    assert!(ok);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Failed);
    assert_eq!(fetched.retry_count, fetched.max_retries);
    assert_eq!(fetched.error_message.as_deref(), Some("unknown task: nope"));

    db.close().await;
    drop_test_db(&db_name).await;
}
