//! Admission, dedup and execution through the task intake.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, ledger, CountingProcessor};
use cv_agents::intake::{AdmitOutcome, IntakeOptions, IntakeWorker, TaskIntake, PARENT_SPAN_KEY};
use cv_agents::membership::{MembershipError, TracePublisher};
use cv_bridge::protocol::TracePayload;
use cv_bridge::work_queue::{InboundWork, WorkQueue};
use cv_core::types::{TaskStatus, LOCAL_AGENT_ID};
use cv_harness::shutdown::ShutdownSignal;

fn work(key: &str, content: &str) -> InboundWork {
    InboundWork::new("cli", "chat-1", "user-1", content).with_idempotency_key(key)
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<TracePayload>>,
}

#[async_trait]
impl TracePublisher for RecordingPublisher {
    async fn publish_trace(&self, trace: TracePayload) -> Result<(), MembershipError> {
        self.published.lock().unwrap().push(trace);
        Ok(())
    }
}

// ===========================================================================
// Dedup
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_execute_once() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new().with_delay(Duration::from_millis(50)));
    let intake = TaskIntake::new(db.clone(), processor.clone(), IntakeOptions::default());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let intake = intake.clone();
        handles.push(tokio::spawn(async move {
            intake.admit(work("grp:T1", "hello")).await.unwrap()
        }));
    }
    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.unwrap());
    }

    assert_eq!(processor.calls(), 1);
    let executed: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, AdmitOutcome::Executed { .. }))
        .collect();
    assert_eq!(executed.len(), 1);
    assert!(outcomes
        .iter()
        .filter(|o| o.is_duplicate())
        .all(|o| matches!(o, AdmitOutcome::InFlight { .. } | AdmitOutcome::Cached { .. })));
    let task_id = executed[0].task_id().to_string();
    assert!(outcomes.iter().all(|o| o.task_id() == task_id));

    // Every later caller observes the same output.
    let again = intake.admit(work("grp:T1", "hello")).await.unwrap();
    assert_eq!(
        again,
        AdmitOutcome::Cached {
            task_id: task_id.clone(),
            output: "done: hello".into()
        }
    );
    assert_eq!(processor.calls(), 1);

    let task = db.get_task_by_idempotency_key("grp:T1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.content_out.as_deref(), Some("done: hello"));
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_redelivered_work_returns_cached_output() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new());
    let intake = TaskIntake::new(db, processor.clone(), IntakeOptions::default());

    let first = intake.admit(work("k1", "ping")).await.unwrap();
    let second = intake.admit(work("k1", "ping, but different")).await.unwrap();
    let third = intake.admit(work("k1", "ping")).await.unwrap();

    assert!(matches!(first, AdmitOutcome::Executed { .. }));
    assert_eq!(second.output(), Some("done: ping"));
    assert_eq!(third.output(), Some("done: ping"));
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_failed_task_is_not_retried() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new().failing("model exploded"));
    let intake = TaskIntake::new(db.clone(), processor.clone(), IntakeOptions::default());

    let first = intake.admit(work("k-fail", "x")).await.unwrap();
    match &first {
        AdmitOutcome::Failed { error, .. } => assert!(error.contains("model exploded")),
        other => panic!("expected failure, got {other:?}"),
    }

    let second = intake.admit(work("k-fail", "x")).await.unwrap();
    match second {
        AdmitOutcome::PreviouslyFailed { task_id, error } => {
            assert_eq!(task_id, first.task_id());
            assert!(error.contains("model exploded"));
        }
        other => panic!("expected previously failed, got {other:?}"),
    }
    assert_eq!(processor.calls(), 1);

    let task = db.get_task(first.task_id()).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_missing_key_is_derived_from_channel_and_trace() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new());
    let intake = TaskIntake::new(db.clone(), processor.clone(), IntakeOptions::default());

    let w = InboundWork::new("slack", "c", "u", "hi").with_trace_id("trace-abc");
    intake.admit(w.clone()).await.unwrap();
    let dup = intake.admit(w).await.unwrap();
    assert!(dup.is_duplicate());

    let task = db
        .get_task_by_idempotency_key("auto:slack:trace-abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.trace_id.as_deref(), Some("trace-abc"));

    // Without a trace id every admission is distinct.
    intake.admit(InboundWork::new("slack", "c", "u", "hi")).await.unwrap();
    intake.admit(InboundWork::new("slack", "c", "u", "hi")).await.unwrap();
    assert_eq!(processor.calls(), 3);
}

// ===========================================================================
// Execution
// ===========================================================================

#[tokio::test]
async fn test_processor_timeout_fails_task() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new().with_delay(Duration::from_millis(500)));
    let options = IntakeOptions {
        processor_timeout: Duration::from_millis(20),
        ..IntakeOptions::default()
    };
    let intake = TaskIntake::new(db.clone(), processor, options);

    let outcome = intake.admit(work("slow", "x")).await.unwrap();
    match outcome {
        AdmitOutcome::Failed { error, .. } => assert!(error.contains("timed out")),
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_token_usage_accumulates_and_quota_blocks() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new().reporting_tokens(5, 5));
    let options = IntakeOptions {
        daily_token_limit: Some(15),
        ..IntakeOptions::default()
    };
    let intake = TaskIntake::new(db.clone(), processor.clone(), options);

    let first = intake.admit(work("q1", "a")).await.unwrap();
    let task = db.get_task(first.task_id()).await.unwrap().unwrap();
    assert_eq!(task.usage.prompt_tokens, 10);
    assert_eq!(task.usage.completion_tokens, 10);
    assert_eq!(task.usage.total_tokens, 20);

    let second = intake.admit(work("q2", "b")).await.unwrap();
    match second {
        AdmitOutcome::Failed { error, .. } => assert!(error.contains("daily token limit")),
        other => panic!("expected quota failure, got {other:?}"),
    }
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_executed_task_records_and_publishes_span() {
    let db = ledger().await;
    let publisher = Arc::new(RecordingPublisher::default());
    let intake = TaskIntake::new(db.clone(), Arc::new(CountingProcessor::new()), IntakeOptions::default())
        .with_publisher(publisher.clone());

    let w = work("span-1", "x")
        .with_trace_id("trace-span")
        .with_metadata(PARENT_SPAN_KEY, "root-span");
    intake.admit(w).await.unwrap();

    let spans = db.spans_for_trace("trace-span").await.unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].agent_id, LOCAL_AGENT_ID);
    assert_eq!(spans[0].span_type, "TASK");
    assert_eq!(spans[0].parent_span_id.as_deref(), Some("root-span"));
    assert_eq!(spans[0].content, "done: x");

    assert!(
        eventually(Duration::from_secs(2), || publisher.published.lock().unwrap().len() == 1).await
    );
    let published = publisher.published.lock().unwrap()[0].clone();
    assert_eq!(published.trace_id, "trace-span");
    assert_eq!(published.span_id, spans[0].span_id);

    // Duplicates neither record nor publish again.
    intake.admit(work("span-1", "x").with_trace_id("trace-span")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(db.spans_for_trace("trace-span").await.unwrap().len(), 1);
    assert_eq!(publisher.published.lock().unwrap().len(), 1);
}

// ===========================================================================
// Worker
// ===========================================================================

#[tokio::test]
async fn test_worker_drains_queue() {
    let db = ledger().await;
    let processor = Arc::new(CountingProcessor::new());
    let intake = TaskIntake::new(db.clone(), processor.clone(), IntakeOptions::default());
    let queue = WorkQueue::unbounded();
    let shutdown = ShutdownSignal::new();

    let worker = tokio::spawn(IntakeWorker::new(intake, queue.clone(), 2).run(shutdown.clone()));

    queue.submit(work("w1", "a")).await;
    queue.submit(work("w2", "b")).await;
    queue.submit(work("w1", "a")).await;

    let p = processor.clone();
    assert!(eventually(Duration::from_secs(2), move || p.calls() == 2).await);
    assert!(
        eventually(Duration::from_secs(2), || queue.is_empty()).await,
        "queue should be drained"
    );

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processor.calls(), 2);
}
