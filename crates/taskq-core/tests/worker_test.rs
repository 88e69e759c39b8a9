//! End-to-end tests for `Worker` driving a registered handler through a real
//! queue manager.

use std::sync::Arc;

use taskq_broker::{Broker, BrokerConfig};
use taskq_core::manager::{EnqueueRequest, QueueManager};
use taskq_core::registry::{HandlerOptions, TaskArgs, TaskRegistry};
use taskq_core::worker::{CycleOutcome, Worker};
use taskq_core::SystemClock;
use taskq_db::models::{Priority, TaskStatus};
use taskq_db::queries::tasks;

use taskq_test_utils::{create_test_db, drop_test_db, redis_url};

async fn setup() -> (Arc<QueueManager>, sqlx::PgPool, String, String) {
    let (db, db_name) = create_test_db().await;
    let broker = Broker::connect(&BrokerConfig::new(redis_url().await))
        .await
        .expect("broker should connect");
    let manager = Arc::new(QueueManager::new(
        db.clone(),
        Arc::new(broker),
        Arc::new(SystemClock),
    ));
    let queue = format!("q-{}", uuid::Uuid::new_v4().simple());
    (manager, db, db_name, queue)
}

#[tokio::test]
async fn worker_runs_successful_handler_to_completion() {
    let (manager, db, db_name, queue) = setup().await;

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
    let registry = Arc::new(registry);

    let task = manager
        .enqueue(EnqueueRequest {
            task_name: "echo".to_owned(),
            args: serde_json::json!([1, 2, 3]),
            kwargs: serde_json::json!({}),
            priority: Priority::Normal,
            max_retries: 3,
            retry_delay_secs: 1,
            timeout_secs: 5,
            queue_name: queue.clone(),
        })
        .await
        .unwrap();

    let worker = Worker::new("worker-1".to_owned(), queue.clone(), manager.clone(), registry);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Ran);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Success);
    assert_eq!(fetched.result, Some(serde_json::json!([1, 2, 3])));

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_idles_when_queue_is_empty() {
    let (manager, db, db_name, queue) = setup().await;
    let registry = Arc::new(TaskRegistry::new());

    let worker = Worker::new("worker-1".to_owned(), queue, manager, registry);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_fails_unknown_task_without_retry() {
    let (manager, db, db_name, queue) = setup().await;
    let registry = Arc::new(TaskRegistry::new());

    let task = manager
        .enqueue(EnqueueRequest {
            task_name: "never_registered".to_owned(),
            args: serde_json::json!([]),
            kwargs: serde_json::json!({}),
            priority: Priority::Normal,
            max_retries: 3,
            retry_delay_secs: 1,
            timeout_secs: 5,
            queue_name: queue.clone(),
        })
        .await
        .unwrap();

    let worker = Worker::new("worker-1".to_owned(), queue, manager, registry);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Ran);

    let fetched = tasks::get_task(&db, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Failed);
    assert!(fetched.error_message.unwrap().contains("unknown task"));
    assert_eq!(fetched.retry_count, fetched.max_retries);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_fails_on_handler_timeout() {
    let (manager, db, db_name, queue) = setup().await;

    let mut registry = TaskRegistry::new();
    registry
        .register(
            "slow",
            Arc::new(|_args: TaskArgs| {
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    Ok(serde_json::Value::Null)
                })
            }),
            HandlerOptions::default(),
        )
        .unwrap();

    manager
        .enqueue(EnqueueRequest {
            task_name: "slow".to_owned(),
            args: serde_json::json!([]),
            kwargs: serde_json::json!({}),
            priority: Priority::Normal,
            max_retries: 3,
            retry_delay_secs: 1,
            timeout_secs: 1,
            queue_name: queue.clone(),
        })
        .await
        .unwrap();

    let worker = Worker::new("worker-1".to_owned(), queue, manager.clone(), Arc::new(registry));
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Ran);

    db.close().await;
    drop_test_db(&db_name).await;
}
