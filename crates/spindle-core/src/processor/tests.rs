use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rstest::rstest;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::config::RetryConfig;
use crate::domain::{Decider, Decision, Payload};
use crate::error::TaskError;
use crate::ports::FixedClock;
use crate::runtime::TaskContext;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(workers: usize) -> ProcessorConfig {
    ProcessorConfig {
        workers,
        poll_interval_ms: 10,
        retry: RetryConfig {
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 10,
            jitter_ratio: 0.0,
        },
        ..ProcessorConfig::default()
    }
}

fn echo_builder(workers: usize) -> ProcessorBuilder {
    Processor::builder()
        .config(fast_config(workers))
        .handler_fn("echo", |ctx| async move { Ok(json!({ "task_id": ctx.task_id })) })
        .unwrap()
}

fn echo(id: &str) -> Task {
    Task::new(json!({})).with_id(id).with_type("echo")
}

type CallLog = Arc<Mutex<HashMap<String, u32>>>;
type Ready = std::future::Ready<std::result::Result<Payload, TaskError>>;

/// Handler that counts invocations per task id.
fn counting(calls: CallLog) -> impl Fn(TaskContext) -> Ready + Send + Sync + 'static {
    move |ctx: TaskContext| {
        *calls
            .lock()
            .unwrap()
            .entry(ctx.task_id.to_string())
            .or_default() += 1;
        std::future::ready(Ok(json!({ "task_id": ctx.task_id })))
    }
}

#[tokio::test]
async fn always_failing_task_without_retries_fails_once() {
    let processor = Processor::builder()
        .config(fast_config(2))
        .handler_fn("boom", |_ctx| async { Err(TaskError::transient("always raises")) })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let id = processor
        .submit(
            Task::new(json!({"x": 1}))
                .with_id("t1")
                .with_type("boom")
                .with_max_retries(0),
        )
        .unwrap();

    let result = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    let failure = result.failure_detail().unwrap();
    assert_eq!(failure.retry_count, 0);
    assert_eq!(failure.message, "always raises");
    assert_eq!(processor.get_status(&id), Some(TaskStatus::Failed));

    processor.shutdown(WAIT).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_tasks_get_their_own_results() {
    let processor = Processor::builder()
        .config(fast_config(8))
        .handler_fn("sleepy", |ctx| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(json!({ "task_id": ctx.task_id }))
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let ids: Vec<TaskId> = (0..100)
        .map(|i| {
            processor
                .submit(Task::new(json!({"i": i})).with_id(format!("task-{i}")).with_type("sleepy"))
                .unwrap()
        })
        .collect();

    for id in &ids {
        let result = processor
            .wait_for_result(id, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(&result.task_id, id);
        assert_eq!(result.payload().unwrap()["task_id"], id.as_str());
    }

    let metrics = processor.get_metrics();
    assert_eq!(metrics.submitted, 100);
    assert_eq!(metrics.completed, 100);
    assert_eq!(metrics.processing, 0);

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    let processor = echo_builder(1).build().unwrap();

    processor.submit(echo("dup")).unwrap();
    let err = processor.submit(echo("dup")).unwrap_err();
    assert!(matches!(err, ProcessorError::DuplicateTask(id) if id.as_str() == "dup"));
    assert_eq!(processor.get_metrics().submitted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_task_body_runs_twice() {
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let processor = Processor::builder()
        .config(fast_config(8))
        .handler_fn("count", counting(Arc::clone(&calls)))
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let ids: Vec<TaskId> = (0..200)
        .map(|i| {
            processor
                .submit(Task::new(json!(null)).with_id(format!("c{i}")).with_type("count"))
                .unwrap()
        })
        .collect();
    for id in &ids {
        processor.wait_for_result(id, WAIT).await.unwrap().unwrap();
    }
    processor.shutdown(WAIT).await;

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 200);
    assert!(calls.values().all(|&n| n == 1), "{calls:?}");
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn retry_bound_is_respected(#[case] k: u32) {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let processor = Processor::builder()
        .config(fast_config(2))
        .handler_fn("flaky", move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::transient("still broken")) }
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let id = processor
        .submit(Task::new(json!(null)).with_id("r").with_type("flaky").with_max_retries(k))
        .unwrap();
    let result = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempts, k + 1);
    assert_eq!(result.failure_detail().unwrap().retry_count, k);
    assert_eq!(attempts.load(Ordering::SeqCst), k + 1);
    assert_eq!(processor.get_metrics().retried, u64::from(k));

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("strict", move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::permanent("bad input")) }
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let id = processor
        .submit(Task::new(json!(null)).with_type("strict").with_max_retries(5))
        .unwrap();
    let result = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();

    assert_eq!(result.failure_detail().unwrap().kind, ErrorKind::Permanent);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn higher_priority_starts_first_with_one_worker() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("p", move |ctx| {
            seen.lock().unwrap().push(ctx.task_id.to_string());
            async { Ok(json!(null)) }
        })
        .unwrap()
        .build()
        .unwrap();

    let burst = [("low-0", 1), ("low-1", 1), ("low-2", 1), ("high-0", 10), ("high-1", 10)];
    let ids: Vec<TaskId> = burst
        .iter()
        .map(|(id, priority)| {
            processor
                .submit(Task::new(json!(null)).with_id(*id).with_type("p").with_priority(*priority))
                .unwrap()
        })
        .collect();

    processor.start().unwrap();
    for id in &ids {
        processor.wait_for_result(id, WAIT).await.unwrap().unwrap();
    }

    let order = order.lock().unwrap().clone();
    assert_eq!(order, ["high-0", "high-1", "low-0", "low-1", "low-2"]);
    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let processor = echo_builder(2).build().unwrap();
    processor.start().unwrap();
    let id = processor.submit(echo("s1")).unwrap();
    processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();

    let first = processor.shutdown(WAIT).await;
    let second = processor.shutdown(WAIT).await;

    assert_eq!(first, second);
    assert!(first.completed_in_time);
    assert!(first.abandoned.is_empty());
    assert!(matches!(
        processor.submit(echo("late")),
        Err(ProcessorError::ShuttingDown)
    ));
    assert!(matches!(processor.start(), Err(ProcessorError::ShuttingDown)));
    assert_eq!(processor.status_counts().processing, 0);
}

#[tokio::test]
async fn concurrent_shutdowns_share_one_report() {
    let processor = echo_builder(2).build().unwrap();
    processor.start().unwrap();
    processor.submit(echo("x")).unwrap();

    let (a, b) = tokio::join!(processor.shutdown(WAIT), processor.shutdown(WAIT));
    assert_eq!(a, b);
}

#[tokio::test]
async fn shutdown_drains_queued_work() {
    let processor = Processor::builder()
        .config(fast_config(2))
        .handler_fn("work", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("done"))
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let ids: Vec<TaskId> = (0..10)
        .map(|_| processor.submit(Task::new(json!(null)).with_type("work")).unwrap())
        .collect();

    let report = processor.shutdown(WAIT).await;
    assert!(report.completed_in_time);
    assert!(report.abandoned.is_empty());
    for id in &ids {
        assert_eq!(processor.get_status(id), Some(TaskStatus::Completed));
    }
}

#[tokio::test]
async fn shutdown_timeout_abandons_stuck_tasks() {
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("stuck", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let running = processor.submit(Task::new(json!(null)).with_id("running").with_type("stuck")).unwrap();
    let queued = processor.submit(Task::new(json!(null)).with_id("queued").with_type("stuck")).unwrap();
    while processor.get_status(&running) != Some(TaskStatus::Processing) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = processor.shutdown(Duration::from_millis(100)).await;
    assert!(!report.completed_in_time);
    assert_eq!(report.abandoned.len(), 2);
    assert!(report.abandoned.contains(&running));
    assert!(report.abandoned.contains(&queued));

    for id in [&running, &queued] {
        assert_eq!(processor.get_status(id), Some(TaskStatus::Failed));
        let result = processor.get_result(id).unwrap();
        assert_eq!(result.failure_detail().unwrap().kind, ErrorKind::Abandoned);
    }
    assert_eq!(processor.status_counts().processing, 0);
    assert_eq!(processor.get_metrics().failed, 2);
}

#[tokio::test]
async fn shutdown_before_start_abandons_queued_tasks() {
    let processor = echo_builder(1).build().unwrap();
    let id = processor.submit(echo("never-ran")).unwrap();

    let report = processor.shutdown(WAIT).await;
    assert_eq!(report.abandoned, vec![id.clone()]);
    assert!(!report.completed_in_time);
    assert_eq!(processor.get_status(&id), Some(TaskStatus::Failed));
}

#[tokio::test]
async fn callback_can_submit_follow_up_work() {
    let processor = echo_builder(1).build().unwrap();
    processor.start().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = processor.clone();
    let first = echo("first").with_callback(move |result: &TaskResult| {
        assert!(result.is_success());
        let _ = tx.send(handle.submit(echo("second")));
    });
    processor.submit(first).unwrap();

    let second = rx.recv().await.unwrap().unwrap();
    let result = processor.wait_for_result(&second, WAIT).await.unwrap().unwrap();
    assert!(result.is_success());

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn panicking_callback_is_contained() {
    let processor = echo_builder(1).build().unwrap();
    processor.start().unwrap();

    processor
        .submit(echo("cb-panics").with_callback(|_result: &TaskResult| panic!("callback bug")))
        .unwrap();
    let next = processor.submit(echo("after")).unwrap();

    assert!(processor.wait_for_result(&next, WAIT).await.unwrap().unwrap().is_success());
    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn cancel_pending_task() {
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("count", counting(Arc::clone(&calls)))
        .unwrap()
        .build()
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = processor
        .submit(
            Task::new(json!(null))
                .with_id("c")
                .with_type("count")
                .with_callback(move |result: &TaskResult| {
                    let _ = tx.send(result.status);
                }),
        )
        .unwrap();

    assert!(processor.cancel(&id));
    assert_eq!(rx.recv().await, Some(TaskStatus::Cancelled));
    assert_eq!(processor.get_status(&id), Some(TaskStatus::Cancelled));
    let result = processor.get_result(&id).unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(result.failure_detail().unwrap().kind, ErrorKind::Cancelled);

    assert!(matches!(
        processor.try_cancel(&id),
        Err(ProcessorError::NotCancellable { status: TaskStatus::Cancelled, .. })
    ));
    assert!(matches!(
        processor.try_cancel(&TaskId::from("nope")),
        Err(ProcessorError::TaskNotFound(_))
    ));

    let metrics = processor.get_metrics();
    assert_eq!(metrics.cancelled, 1);
    assert_eq!(metrics.queue_depth, 0);

    processor.start().unwrap();
    let report = processor.shutdown(WAIT).await;
    assert!(report.completed_in_time);
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn full_queue_rejects_without_registering() {
    let processor = echo_builder(1)
        .config(ProcessorConfig {
            queue_capacity: 2,
            ..fast_config(1)
        })
        .build()
        .unwrap();

    processor.submit(echo("a")).unwrap();
    processor.submit(echo("b")).unwrap();
    let err = processor.submit(echo("c")).unwrap_err();

    assert!(matches!(err, ProcessorError::QueueFull { capacity: 2 }));
    assert_eq!(processor.get_status(&TaskId::from("c")), None);
    assert_eq!(processor.get_metrics().submitted, 2);
    assert_eq!(processor.get_metrics().queue_depth, 2);
}

#[tokio::test]
async fn wait_for_unknown_task_is_not_found() {
    let processor = echo_builder(1).build().unwrap();
    let err = processor
        .wait_for_result(&TaskId::from("ghost"), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessorError::TaskNotFound(_)));
}

#[tokio::test]
async fn wait_for_result_times_out_with_none() {
    let processor = echo_builder(1).build().unwrap();
    let id = processor.submit(echo("not-started")).unwrap();
    let got = processor
        .wait_for_result(&id, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn forced_resubmission_replaces_finished_task() {
    let runs = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&runs);
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("again", move |_ctx| {
            let run = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({ "run": run }))
            }
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let task = || Task::new(json!(null)).with_id("again").with_type("again");
    let id = processor.submit(task()).unwrap();
    let first = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();
    assert_eq!(first.payload().unwrap()["run"], 1);

    assert!(matches!(
        processor.submit(task()),
        Err(ProcessorError::DuplicateTask(_))
    ));

    processor
        .submit_with(task(), SubmitOptions { force: true })
        .unwrap();
    // the first run's result is gone as soon as the replacement is accepted
    assert!(processor.get_result(&id).is_none());

    let second = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();
    assert_eq!(second.payload().unwrap()["run"], 2);
    assert_eq!(processor.get_status(&id), Some(TaskStatus::Completed));
    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn panicking_body_fails_the_task_and_worker_survives() {
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("maybe", |ctx| async move {
            if ctx.payload["explode"] == true {
                panic!("body bug");
            }
            Ok(json!("fine"))
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let bad = processor
        .submit(Task::new(json!({"explode": true})).with_type("maybe").with_max_retries(0))
        .unwrap();
    let good = processor
        .submit(Task::new(json!({"explode": false})).with_type("maybe"))
        .unwrap();

    let bad = processor.wait_for_result(&bad, WAIT).await.unwrap().unwrap();
    assert_eq!(bad.failure_detail().unwrap().kind, ErrorKind::Panic);
    let good = processor.wait_for_result(&good, WAIT).await.unwrap().unwrap();
    assert!(good.is_success());

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn slow_body_hits_task_timeout() {
    let processor = Processor::builder()
        .config(ProcessorConfig {
            task_timeout_ms: Some(30),
            ..fast_config(1)
        })
        .handler_fn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!(null))
        })
        .unwrap()
        .build()
        .unwrap();
    processor.start().unwrap();

    let id = processor
        .submit(Task::new(json!(null)).with_type("slow").with_max_retries(0))
        .unwrap();
    let result = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();
    assert_eq!(result.failure_detail().unwrap().kind, ErrorKind::Timeout);
    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn unknown_task_type_fails_without_retry() {
    let processor = echo_builder(1).build().unwrap();
    processor.start().unwrap();

    let id = processor
        .submit(Task::new(json!(null)).with_type("nobody-handles-this"))
        .unwrap();
    let result = processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();
    assert_eq!(result.failure_detail().unwrap().kind, ErrorKind::HandlerNotFound);
    assert_eq!(result.attempts, 1);
    processor.shutdown(WAIT).await;
}

/// Panics on its first decision, then fails everything.
struct PanicsOnce(AtomicBool);

impl Decider for PanicsOnce {
    fn decide(&self, _task: &Task, _failure: &TaskFailure) -> Decision {
        if !self.0.swap(true, Ordering::SeqCst) {
            panic!("decider bug");
        }
        Decision::Fail {
            reason: "no retries".to_string(),
        }
    }
}

#[tokio::test]
async fn crashed_worker_is_replaced() {
    let processor = Processor::builder()
        .config(fast_config(1))
        .handler_fn("mixed", |ctx| async move {
            if ctx.payload["fail"] == true {
                Err(TaskError::transient("fails"))
            } else {
                Ok(json!("ok"))
            }
        })
        .unwrap()
        .decider(Arc::new(PanicsOnce(AtomicBool::new(false))))
        .build()
        .unwrap();
    processor.start().unwrap();

    let crashed = processor
        .submit(Task::new(json!({"fail": true})).with_type("mixed"))
        .unwrap();
    let crashed = processor.wait_for_result(&crashed, WAIT).await.unwrap().unwrap();
    assert_eq!(crashed.failure_detail().unwrap().kind, ErrorKind::Abandoned);

    let next = processor
        .submit(Task::new(json!({"fail": false})).with_type("mixed"))
        .unwrap();
    let next = processor.wait_for_result(&next, WAIT).await.unwrap().unwrap();
    assert!(next.is_success());
    assert_eq!(processor.get_metrics().live_workers, 1);

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn cleanup_drops_old_finished_tasks() {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let processor = echo_builder(1).clock(clock.clone()).build().unwrap();
    processor.start().unwrap();

    let id = processor.submit(echo("old")).unwrap();
    processor.wait_for_result(&id, WAIT).await.unwrap().unwrap();

    assert_eq!(processor.cleanup(Duration::from_secs(3600)), 0);
    clock.advance(chrono::Duration::hours(2));
    assert_eq!(processor.cleanup(Duration::from_secs(3600)), 1);

    assert_eq!(processor.get_status(&id), None);
    assert!(processor.get_result(&id).is_none());
    processor.shutdown(WAIT).await;
}

#[test]
fn build_requires_a_handler() {
    let err = Processor::builder().build().err().unwrap();
    assert!(matches!(err, ProcessorError::NoHandlers));
}

#[test]
fn build_rejects_invalid_config() {
    let err = echo_builder(1)
        .config(ProcessorConfig {
            workers: 0,
            ..ProcessorConfig::default()
        })
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ProcessorError::InvalidConfig(_)));
}

#[test]
fn duplicate_handler_is_rejected() {
    let err = echo_builder(1)
        .handler_fn("echo", |_ctx| async { Ok(json!(null)) })
        .err()
        .unwrap();
    assert!(matches!(err, ProcessorError::DuplicateHandler(t) if t.as_str() == "echo"));
}

#[test]
fn start_outside_runtime_is_an_error() {
    let processor = echo_builder(1).build().unwrap();
    assert!(matches!(
        processor.start(),
        Err(ProcessorError::WorkerInternal(_))
    ));
}
