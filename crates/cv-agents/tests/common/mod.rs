#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cv_agents::membership::{MembershipManager, MembershipOptions};
use cv_agents::processor::{ProcessorError, TaskProcessor, WorkContext};
use cv_bridge::transport::{GroupTransport, InProcessBroker};
use cv_core::ledger::LedgerDb;
use cv_core::types::AgentIdentity;

/// Echoes its input after an optional delay and counts invocations.
pub struct CountingProcessor {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail_with: Option<String>,
    pub tokens: Option<(i64, i64)>,
}

impl CountingProcessor {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_with: None,
            tokens: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: &str) -> Self {
        self.fail_with = Some(error.to_string());
        self
    }

    pub fn reporting_tokens(mut self, prompt: i64, completion: i64) -> Self {
        self.tokens = Some((prompt, completion));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskProcessor for CountingProcessor {
    async fn process(&self, ctx: &WorkContext, content: &str) -> Result<String, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((prompt, completion)) = self.tokens {
            ctx.usage.record(prompt, completion).await.unwrap();
            ctx.usage.record(prompt, completion).await.unwrap();
        }
        match &self.fail_with {
            Some(err) => Err(ProcessorError::Failed(err.clone())),
            None => Ok(format!("done: {content}")),
        }
    }
}

pub async fn ledger() -> Arc<LedgerDb> {
    Arc::new(LedgerDb::new_in_memory().await.unwrap())
}

pub fn options(heartbeat: Duration) -> MembershipOptions {
    MembershipOptions {
        heartbeat_interval: heartbeat,
        join_timeout: Duration::from_secs(2),
        leave_timeout: Duration::from_secs(2),
    }
}

pub fn manager(
    broker: &InProcessBroker,
    agent_id: &str,
    ledger: Arc<LedgerDb>,
    heartbeat: Duration,
) -> MembershipManager {
    let transport: Arc<dyn GroupTransport> = Arc::new(broker.clone());
    MembershipManager::new(
        "ops",
        AgentIdentity::new(agent_id, agent_id.to_uppercase()).with_capabilities(["search"]),
        transport,
        ledger,
        options(heartbeat),
    )
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
