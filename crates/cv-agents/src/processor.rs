use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::types::MessageKind;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor failed: {0}")]
    Failed(String),

    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

/// Reports token usage for the task being processed. Every call adds to the
/// task's running totals.
#[derive(Clone)]
pub struct UsageRecorder {
    ledger: Arc<LedgerDb>,
    task_id: String,
}

impl UsageRecorder {
    pub(crate) fn new(ledger: Arc<LedgerDb>, task_id: impl Into<String>) -> Self {
        Self {
            ledger,
            task_id: task_id.into(),
        }
    }

    pub async fn record(&self, prompt_tokens: i64, completion_tokens: i64) -> Result<(), LedgerError> {
        self.ledger
            .add_token_usage(&self.task_id, prompt_tokens, completion_tokens)
            .await
    }
}

/// What a processor knows about the task it is running.
#[derive(Clone)]
pub struct WorkContext {
    pub task_id: String,
    pub trace_id: String,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub metadata: BTreeMap<String, String>,
    pub usage: UsageRecorder,
}

/// The opaque `content -> response` step. Invoked at most once per
/// idempotency key.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, ctx: &WorkContext, content: &str) -> Result<String, ProcessorError>;
}
