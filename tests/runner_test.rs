//! Queue runner behaviour with in-process invokers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sparkq::db::Db;
use sparkq::engine::{RunMode, RunSummary, Runner, RunnerConfig, Shutdown};
use sparkq::invoker::{DryRunInvoker, Invocation, Invoker};
use sparkq::model::{
    AUTO_FAIL_ERROR_TYPE, EXECUTION_ERROR_TYPE, NewTask, Queue, TaskFilter, TaskId, TaskStatus,
};

async fn setup() -> (Db, Queue) {
    let db = Db::in_memory().await.unwrap();
    db.ensure_project("test", None).await.unwrap();
    let session = db.create_session("s1", None).await.unwrap();
    let queue = db.create_queue(session.id, "jobs", None).await.unwrap();
    (db, queue)
}

async fn enqueue(db: &Db, queue: &Queue, prompt: &str) -> TaskId {
    db.create_task(
        NewTask::new(queue.id, "llm-haiku", "LLM_LITE", 30).payload(&json!({"prompt": prompt})),
    )
    .await
    .unwrap()
    .id
}

async fn runner(db: &Db, invoker: Arc<dyn Invoker>, mode: RunMode) -> Runner {
    Runner::for_queue(
        db.clone(),
        invoker,
        "jobs",
        RunnerConfig {
            mode,
            poll_interval: Duration::from_millis(10),
        },
        Shutdown::new(),
    )
    .await
    .unwrap()
}

/// Fails every prompt containing "bad", echoes the rest.
struct PickyInvoker;

#[async_trait]
impl Invoker for PickyInvoker {
    fn name(&self) -> &str {
        "picky"
    }

    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Invocation {
        if prompt.contains("bad") {
            Invocation::failed(format!("refused: {prompt}"))
        } else {
            Invocation::ok(prompt.to_uppercase()).with_usage(json!({"tokens": 3}))
        }
    }
}

/// Something else fails the running task while the invoker is busy.
struct InterruptedInvoker {
    db: Db,
    by_watchdog: bool,
}

#[async_trait]
impl Invoker for InterruptedInvoker {
    fn name(&self) -> &str {
        "interrupted"
    }

    async fn invoke(&self, _prompt: &str, _timeout: Duration) -> Invocation {
        let running = self
            .db
            .list_tasks(&TaskFilter {
                status: Some("running".into()),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        for task in running {
            if self.by_watchdog {
                assert!(self.db.auto_fail_task(task.id, "too slow").await.unwrap());
            } else {
                self.db
                    .fail_task(task.id, "cancelled by operator", None)
                    .await
                    .unwrap();
            }
        }
        Invocation::ok("finished anyway")
    }
}

#[tokio::test]
async fn once_runs_only_the_oldest_task() {
    let (db, queue) = setup().await;
    let first = enqueue(&db, &queue, "t1").await;
    let second = enqueue(&db, &queue, "t2").await;

    let invoker = Arc::new(DryRunInvoker::new());
    let summary = runner(&db, invoker.clone(), RunMode::Once)
        .await
        .run()
        .await
        .unwrap();

    assert_eq!(summary, RunSummary { succeeded: 1, failed: 0 });
    assert_eq!(invoker.prompts(), vec!["t1".to_string()]);

    let done = db.get_task(first).await.unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.result_summary.as_deref(), Some("[dry-run] t1"));
    assert_eq!(done.result.unwrap()["response"], json!("[dry-run] t1"));
    assert_eq!(db.get_task(second).await.unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn once_on_empty_queue_does_nothing() {
    let (db, _queue) = setup().await;
    let summary = runner(&db, Arc::new(DryRunInvoker::new()), RunMode::Once)
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(summary, RunSummary::default());
}

#[tokio::test]
async fn drain_runs_everything_in_fifo_order() {
    let (db, queue) = setup().await;
    for prompt in ["a", "b", "c"] {
        enqueue(&db, &queue, prompt).await;
    }

    let invoker = Arc::new(DryRunInvoker::new());
    let summary = runner(&db, invoker.clone(), RunMode::Drain)
        .await
        .run()
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(invoker.prompts(), vec!["a", "b", "c"]);
    assert_eq!(db.queue_stats(queue.id).await.unwrap().succeeded, 3);
}

#[tokio::test]
async fn invoker_errors_fail_the_task_and_the_loop_continues() {
    let (db, queue) = setup().await;
    let bad = enqueue(&db, &queue, "bad input").await;
    let good = enqueue(&db, &queue, "fine").await;

    let summary = runner(&db, Arc::new(PickyInvoker), RunMode::Drain)
        .await
        .run()
        .await
        .unwrap();
    assert_eq!(summary, RunSummary { succeeded: 1, failed: 1 });

    let failed = db.get_task(bad).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_type.as_deref(), Some(EXECUTION_ERROR_TYPE));
    assert_eq!(
        failed.error.as_deref(),
        Some("EXECUTION_ERROR: refused: bad input")
    );

    let done = db.get_task(good).await.unwrap();
    assert_eq!(done.result_summary.as_deref(), Some("FINE"));
    assert_eq!(done.result.unwrap()["usage"], json!({"tokens": 3}));
}

#[tokio::test]
async fn non_json_payload_is_used_verbatim() {
    let (db, queue) = setup().await;
    let id = db
        .create_task(NewTask::new(queue.id, "script", "FAST_SCRIPT", 30).raw_payload("echo {oops"))
        .await
        .unwrap()
        .id;

    let invoker = Arc::new(DryRunInvoker::new());
    runner(&db, invoker.clone(), RunMode::Once)
        .await
        .run()
        .await
        .unwrap();

    assert_eq!(invoker.prompts(), vec!["echo {oops"]);
    assert_eq!(db.get_task(id).await.unwrap().status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn blank_response_gets_default_summary() {
    struct Blank;

    #[async_trait]
    impl Invoker for Blank {
        fn name(&self) -> &str {
            "blank"
        }
        async fn invoke(&self, _prompt: &str, _timeout: Duration) -> Invocation {
            Invocation::ok("\n   \n")
        }
    }

    let (db, queue) = setup().await;
    let id = enqueue(&db, &queue, "x").await;
    runner(&db, Arc::new(Blank), RunMode::Once)
        .await
        .run()
        .await
        .unwrap();

    let task = db.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.result_summary.as_deref(), Some("Task completed"));
}

#[tokio::test]
async fn late_result_rescues_watchdog_failure() {
    let (db, queue) = setup().await;
    let id = enqueue(&db, &queue, "slow").await;

    let invoker = Arc::new(InterruptedInvoker {
        db: db.clone(),
        by_watchdog: true,
    });
    let summary = runner(&db, invoker, RunMode::Once).await.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let task = db.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.result_summary.as_deref(), Some("finished anyway"));
    assert!(task.error.is_none());
    assert_ne!(task.error_type.as_deref(), Some(AUTO_FAIL_ERROR_TYPE));
}

#[tokio::test]
async fn late_result_does_not_override_operator_failure() {
    let (db, queue) = setup().await;
    let id = enqueue(&db, &queue, "slow").await;

    let invoker = Arc::new(InterruptedInvoker {
        db: db.clone(),
        by_watchdog: false,
    });
    let summary = runner(&db, invoker, RunMode::Once).await.run().await.unwrap();
    assert_eq!(summary, RunSummary { succeeded: 0, failed: 1 });

    let task = db.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("cancelled by operator"));
}

#[tokio::test]
async fn watch_mode_picks_up_new_work_until_shutdown() {
    let (db, queue) = setup().await;
    let shutdown = Shutdown::new();
    let invoker = Arc::new(DryRunInvoker::new());

    let runner = Runner::for_queue(
        db.clone(),
        invoker.clone(),
        &queue.id.to_string(),
        RunnerConfig {
            mode: RunMode::Watch,
            poll_interval: Duration::from_millis(10),
        },
        shutdown.clone(),
    )
    .await
    .unwrap();
    let handle = tokio::spawn(async move { runner.run().await });

    let id = enqueue(&db, &queue, "later").await;
    for _ in 0..300 {
        if db.get_task(id).await.unwrap().status == TaskStatus::Succeeded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.trigger();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(invoker.prompts(), vec!["later"]);
}

#[tokio::test]
async fn unknown_queue_is_not_found() {
    let db = Db::in_memory().await.unwrap();
    let err = Runner::for_queue(
        db,
        Arc::new(DryRunInvoker::new()),
        "nope",
        RunnerConfig::default(),
        Shutdown::new(),
    )
    .await
    .err()
    .unwrap();
    assert!(err.is_not_found());
}
