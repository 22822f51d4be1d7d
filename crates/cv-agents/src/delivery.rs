//! Outbound delivery of finished tasks.
//!
//! Delivery state is independent of task status: a completed task can be
//! retried here any number of times without touching its result.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::Utc;
use cv_core::config::DeliveryConfig;
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::types::{AgentTask, DeliveryStatus, MessageKind, ResponseStatus, TaskStatus, GROUP_CHANNEL};
use cv_harness::shutdown::ShutdownSignal;
use cv_telemetry::metrics::{global_metrics, names};
use tracing::{debug, info, warn};

use crate::group_tasks::{GroupTaskError, GroupTasks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Sent,
    /// Nothing to deliver for this task.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Failed(String),

    #[error(transparent)]
    GroupTask(#[from] GroupTaskError),
}

/// Hands a finished task's result back to wherever it came from.
#[async_trait]
pub trait OutboundSink: Send + Sync + 'static {
    async fn deliver(&self, task: &AgentTask) -> Result<SinkOutcome, SinkError>;
}

/// Counts from one delivery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct DeliveryWorker {
    ledger: Arc<LedgerDb>,
    sinks: AHashMap<String, Arc<dyn OutboundSink>>,
    config: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(ledger: Arc<LedgerDb>, config: DeliveryConfig) -> Self {
        Self {
            ledger,
            sinks: AHashMap::new(),
            config,
        }
    }

    pub fn with_sink(mut self, channel: impl Into<String>, sink: Arc<dyn OutboundSink>) -> Self {
        self.sinks.insert(channel.into(), sink);
        self
    }

    /// Deliver every task that is due, once.
    pub async fn run_once(&self) -> Result<DeliveryStats, LedgerError> {
        let due = self
            .ledger
            .list_pending_deliveries(self.config.batch_size)
            .await?;
        let mut stats = DeliveryStats::default();
        for task in due {
            let status = self.deliver_one(&task).await?;
            let label = match status {
                DeliveryStatus::Sent => {
                    stats.sent += 1;
                    "sent"
                }
                DeliveryStatus::Skipped => {
                    stats.skipped += 1;
                    "skipped"
                }
                DeliveryStatus::Pending => {
                    stats.retried += 1;
                    "retry"
                }
                DeliveryStatus::Failed => {
                    stats.failed += 1;
                    "failed"
                }
            };
            global_metrics().increment_counter(names::DELIVERIES, &[("result", label)]);
        }
        Ok(stats)
    }

    async fn deliver_one(&self, task: &AgentTask) -> Result<DeliveryStatus, LedgerError> {
        let Some(sink) = self.sinks.get(&task.channel) else {
            debug!(task_id = %task.task_id, channel = %task.channel, "no sink for channel");
            self.ledger
                .update_delivery(&task.task_id, DeliveryStatus::Skipped, None)
                .await?;
            return Ok(DeliveryStatus::Skipped);
        };

        let (status, next_retry_at) = match sink.deliver(task).await {
            Ok(SinkOutcome::Sent) => (DeliveryStatus::Sent, None),
            Ok(SinkOutcome::Skipped) => (DeliveryStatus::Skipped, None),
            Err(e) => {
                let attempts = task.delivery_attempts.max(0) as u32;
                if attempts + 1 >= self.config.max_attempts {
                    warn!(task_id = %task.task_id, attempts = attempts + 1, error = %e, "delivery abandoned");
                    (DeliveryStatus::Failed, None)
                } else {
                    let backoff = self.config.backoff(attempts);
                    let next = chrono::Duration::from_std(backoff)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d));
                    warn!(task_id = %task.task_id, attempt = attempts + 1, retry_in_secs = backoff.as_secs(), error = %e, "delivery failed");
                    (DeliveryStatus::Pending, next)
                }
            }
        };
        self.ledger
            .update_delivery(&task.task_id, status, next_retry_at)
            .await?;
        Ok(status)
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.run_once().await {
                    Ok(stats) if stats != DeliveryStats::default() => {
                        info!(?stats, "delivery pass");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "delivery pass failed"),
                },
            }
        }
        debug!("delivery worker stopped");
    }
}

/// Answers group requests with the local result. Responses from peers are
/// never answered.
pub struct GroupResponseSink {
    tasks: GroupTasks,
}

impl GroupResponseSink {
    pub fn new(tasks: GroupTasks) -> Self {
        Self { tasks }
    }

    pub fn channel() -> &'static str {
        GROUP_CHANNEL
    }
}

#[async_trait]
impl OutboundSink for GroupResponseSink {
    async fn deliver(&self, task: &AgentTask) -> Result<SinkOutcome, SinkError> {
        if task.message_kind != MessageKind::GroupRequest {
            return Ok(SinkOutcome::Skipped);
        }
        let (content, status) = match task.status {
            TaskStatus::Completed => (
                task.content_out.clone().unwrap_or_default(),
                ResponseStatus::Completed,
            ),
            TaskStatus::Failed => (
                task.error_text.clone().unwrap_or_default(),
                ResponseStatus::Failed,
            ),
            TaskStatus::Pending | TaskStatus::Processing => return Ok(SinkOutcome::Skipped),
        };
        // Group work uses the group task id as its chat id.
        self.tasks
            .respond_task(&task.chat_id, &content, status)
            .await?;
        Ok(SinkOutcome::Sent)
    }
}
