//! Admission of inbound work.
//!
//! Every ingress path funnels through [`TaskIntake::admit`]: the ledger is
//! consulted by idempotency key before anything runs, so a unit of work
//! redelivered by the transport or submitted twice by an adapter executes at
//! most once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cv_bridge::work_queue::{InboundWork, WorkQueue};
use cv_core::config::IntakeConfig;
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::types::{AgentTask, NewSpan, NewTask, TaskStatus};
use cv_harness::shutdown::ShutdownSignal;
use cv_telemetry::metrics::{global_metrics, names};
use cv_telemetry::tracing_setup::{generate_span_id, generate_trace_id, task_span};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

use crate::correlator::{trace_payload, TraceCorrelator};
use crate::membership::TracePublisher;
use crate::processor::{TaskProcessor, UsageRecorder, WorkContext};

/// Metadata key an adapter may set to chain the task span under an
/// existing span.
pub const PARENT_SPAN_KEY: &str = "parent_span_id";

const TASK_SPAN_TYPE: &str = "TASK";

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// The dedup lookup itself failed. Admission is aborted rather than
    /// risking a second execution.
    #[error("dedup lookup failed: {0}")]
    DedupUnavailable(#[source] LedgerError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// How an admission resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// This call ran the processor and it succeeded.
    Executed { task_id: String, output: String },
    /// This call ran (or refused to run) the work and it failed.
    Failed { task_id: String, error: String },
    /// Already completed; the recorded output is returned.
    Cached { task_id: String, output: String },
    /// Another execution holds the key. Nothing was run.
    InFlight { task_id: String },
    /// Already failed; the recorded error is returned.
    PreviouslyFailed { task_id: String, error: String },
}

impl AdmitOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            AdmitOutcome::Executed { task_id, .. }
            | AdmitOutcome::Failed { task_id, .. }
            | AdmitOutcome::Cached { task_id, .. }
            | AdmitOutcome::InFlight { task_id }
            | AdmitOutcome::PreviouslyFailed { task_id, .. } => task_id,
        }
    }

    /// The final output, if the task has completed.
    pub fn output(&self) -> Option<&str> {
        match self {
            AdmitOutcome::Executed { output, .. } | AdmitOutcome::Cached { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }

    /// `true` when the ledger already held the key.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            AdmitOutcome::Cached { .. }
                | AdmitOutcome::InFlight { .. }
                | AdmitOutcome::PreviouslyFailed { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            AdmitOutcome::Executed { .. } => "executed",
            AdmitOutcome::Failed { .. } => "failed",
            AdmitOutcome::Cached { .. } => "cached",
            AdmitOutcome::InFlight { .. } => "in_flight",
            AdmitOutcome::PreviouslyFailed { .. } => "previously_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeOptions {
    pub processor_timeout: Duration,
    pub daily_token_limit: Option<i64>,
    pub trace_publish_timeout: Duration,
}

impl IntakeOptions {
    pub fn from_config(config: &IntakeConfig) -> Self {
        Self {
            processor_timeout: config.processor_timeout(),
            daily_token_limit: config.daily_token_limit,
            ..Self::default()
        }
    }
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self {
            processor_timeout: Duration::from_secs(300),
            daily_token_limit: None,
            trace_publish_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    ledger: Arc<LedgerDb>,
    processor: Arc<dyn TaskProcessor>,
    correlator: TraceCorrelator,
    options: IntakeOptions,
}

#[derive(Clone)]
pub struct TaskIntake {
    inner: Arc<Inner>,
    publisher: Option<Arc<dyn TracePublisher>>,
}

impl TaskIntake {
    pub fn new(
        ledger: Arc<LedgerDb>,
        processor: Arc<dyn TaskProcessor>,
        options: IntakeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                correlator: TraceCorrelator::new(ledger.clone()),
                ledger,
                processor,
                options,
            }),
            publisher: None,
        }
    }

    /// Share each executed task's span with the group through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn TracePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Admit one unit of work, running the processor only if its
    /// idempotency key has never been seen.
    pub async fn admit(&self, work: InboundWork) -> Result<AdmitOutcome, IntakeError> {
        let trace_id = work
            .trace_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(generate_trace_id);
        let key = work
            .idempotency_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| format!("auto:{}:{}", work.channel, trace_id));

        let ledger = &self.inner.ledger;
        if let Some(existing) = ledger
            .get_task_by_idempotency_key(&key)
            .await
            .map_err(IntakeError::DedupUnavailable)?
        {
            return Ok(self.duplicate(&key, existing));
        }

        let new_task = NewTask {
            task_id: None,
            idempotency_key: Some(key.clone()),
            trace_id: Some(trace_id.clone()),
            channel: work.channel.clone(),
            chat_id: work.chat_id.clone(),
            sender_id: Some(work.sender_id.clone()).filter(|s| !s.is_empty()),
            message_kind: work.kind,
            content_in: work.content.clone(),
        };
        let task = match ledger.create_task(new_task).await {
            Ok(task) => task,
            Err(LedgerError::DuplicateIdempotencyKey(_)) => {
                // Lost the insert race to a concurrent admission.
                let winner = ledger
                    .get_task_by_idempotency_key(&key)
                    .await
                    .map_err(IntakeError::DedupUnavailable)?
                    .ok_or_else(|| {
                        IntakeError::DedupUnavailable(LedgerError::TaskNotFound(key.clone()))
                    })?;
                return Ok(self.duplicate(&key, winner));
            }
            Err(e) => return Err(e.into()),
        };

        let span = task_span(&task.task_id, &trace_id, &task.channel);
        self.execute(task, trace_id, work).instrument(span).await
    }

    fn duplicate(&self, key: &str, task: AgentTask) -> AdmitOutcome {
        let task_id = task.task_id;
        let outcome = match task.status {
            TaskStatus::Completed => AdmitOutcome::Cached {
                task_id,
                output: task.content_out.unwrap_or_default(),
            },
            TaskStatus::Failed => AdmitOutcome::PreviouslyFailed {
                task_id,
                error: task.error_text.unwrap_or_default(),
            },
            TaskStatus::Pending | TaskStatus::Processing => AdmitOutcome::InFlight { task_id },
        };
        global_metrics().increment_counter(names::DEDUP_HITS, &[("outcome", outcome.label())]);
        debug!(idempotency_key = %key, task_id = %outcome.task_id(), outcome = outcome.label(), "duplicate admission");
        outcome
    }

    async fn execute(
        &self,
        task: AgentTask,
        trace_id: String,
        work: InboundWork,
    ) -> Result<AdmitOutcome, IntakeError> {
        let ledger = &self.inner.ledger;
        let task_id = task.task_id.clone();
        ledger
            .update_task_status(&task_id, TaskStatus::Processing, None, None)
            .await?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match self.quota_exceeded().await {
            Some(reason) => Err(reason),
            None => self.run_processor(&task_id, &trace_id, &work).await,
        };
        let elapsed = clock.elapsed();

        let outcome = match result {
            Ok(output) => {
                ledger
                    .update_task_status(&task_id, TaskStatus::Completed, Some(output.clone()), None)
                    .await?;
                info!(duration_ms = elapsed.as_millis() as u64, "task completed");
                AdmitOutcome::Executed {
                    task_id: task_id.clone(),
                    output,
                }
            }
            Err(error) => {
                ledger
                    .update_task_status(&task_id, TaskStatus::Failed, None, Some(error.clone()))
                    .await?;
                warn!(error = %error, "task failed");
                AdmitOutcome::Failed {
                    task_id: task_id.clone(),
                    error,
                }
            }
        };
        let metrics = global_metrics();
        metrics.increment_counter(names::TASKS_EXECUTED, &[("result", outcome.label())]);
        metrics.record_histogram(names::TASK_DURATION, elapsed.as_secs_f64());

        let span = NewSpan {
            trace_id,
            span_id: Some(generate_span_id()),
            parent_span_id: work.metadata.get(PARENT_SPAN_KEY).cloned(),
            span_type: TASK_SPAN_TYPE.to_string(),
            title: format!("{} task {}", work.channel, task_id),
            content: match &outcome {
                AdmitOutcome::Executed { output, .. } => output.clone(),
                AdmitOutcome::Failed { error, .. } => error.clone(),
                _ => String::new(),
            },
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
            duration_ms: elapsed.as_millis() as i64,
            ..NewSpan::default()
        };
        self.record_and_publish(span).await;
        Ok(outcome)
    }

    /// `Some(reason)` when today's usage has reached the limit. A failed
    /// usage read lets the task through.
    async fn quota_exceeded(&self) -> Option<String> {
        let limit = self.inner.options.daily_token_limit?;
        match self.inner.ledger.daily_token_usage().await {
            Ok(used) if used >= limit => {
                Some(format!("daily token limit reached ({used}/{limit})"))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "daily usage read failed, not enforcing quota");
                None
            }
        }
    }

    async fn run_processor(
        &self,
        task_id: &str,
        trace_id: &str,
        work: &InboundWork,
    ) -> Result<String, String> {
        let ctx = WorkContext {
            task_id: task_id.to_string(),
            trace_id: trace_id.to_string(),
            channel: work.channel.clone(),
            chat_id: work.chat_id.clone(),
            sender_id: work.sender_id.clone(),
            kind: work.kind,
            metadata: work.metadata.clone(),
            usage: UsageRecorder::new(self.inner.ledger.clone(), task_id),
        };
        let timeout = self.inner.options.processor_timeout;
        match tokio::time::timeout(timeout, self.inner.processor.process(&ctx, &work.content)).await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("processor timed out after {}s", timeout.as_secs())),
        }
    }

    async fn record_and_publish(&self, span: NewSpan) {
        if let Err(e) = self.inner.correlator.record_local_span(span.clone()).await {
            warn!(error = %e, "failed to record task span");
        }
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let payload = trace_payload(&span);
        let timeout = self.inner.options.trace_publish_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, publisher.publish_trace(payload)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "trace publish failed"),
                Err(_) => warn!("trace publish timed out"),
            }
        });
    }
}

/// Drains a [`WorkQueue`] into the intake, running up to `max_concurrent`
/// admissions at once.
pub struct IntakeWorker {
    intake: TaskIntake,
    queue: WorkQueue,
    permits: Arc<Semaphore>,
}

impl IntakeWorker {
    pub fn new(intake: TaskIntake, queue: WorkQueue, max_concurrent: usize) -> Self {
        Self {
            intake,
            queue,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        loop {
            let work = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(work) => work,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let intake = self.intake.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let channel = work.channel.clone();
                match intake.admit(work).await {
                    Ok(outcome) => {
                        debug!(channel = %channel, task_id = %outcome.task_id(), outcome = outcome.label(), "work admitted")
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "work not admitted"),
                }
            });
        }
        debug!("intake worker stopped");
    }
}
