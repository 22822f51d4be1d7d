//! Membership lifecycle for the local agent.
//!
//! `Detached -> Active` on [`MembershipManager::join`], `Active -> Detached`
//! on [`MembershipManager::leave`]. While active, two periodic tasks run
//! under one [`TaskScope`]: the heartbeat publisher and the stale sweep.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cv_bridge::protocol::{
    AnnounceAction, AnnouncePayload, GroupEnvelope, Payload, TopicNames, TracePayload,
};
use cv_bridge::transport::{publish_envelope, GroupTransport, TransportError};
use cv_core::config::GroupConfig;
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::types::{AgentIdentity, GroupMember};
use cv_harness::shutdown::{ShutdownSignal, TaskScope};
use cv_telemetry::metrics::{global_metrics, names};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::roster::Roster;

/// Stale window as a multiple of the heartbeat interval.
const STALE_FACTOR: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("already active in the group")]
    AlreadyActive,

    #[error("not active in any group")]
    NotActive,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("announce timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipOptions {
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub leave_timeout: Duration,
}

impl MembershipOptions {
    pub fn from_config(config: &GroupConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            join_timeout: config.join_timeout(),
            leave_timeout: config.leave_timeout(),
        }
    }

    pub fn stale_window(&self) -> Duration {
        self.heartbeat_interval * STALE_FACTOR
    }
}

/// Publishes spans to the group's trace topic.
#[async_trait]
pub trait TracePublisher: Send + Sync + 'static {
    async fn publish_trace(&self, trace: TracePayload) -> Result<(), MembershipError>;
}

/// Point-in-time view for health and status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub active: bool,
    pub group_name: String,
    pub agent_id: String,
    pub member_count: usize,
    pub topics: Vec<String>,
}

struct Inner {
    group_name: String,
    topics: TopicNames,
    identity: AgentIdentity,
    joined_identity: RwLock<Option<AgentIdentity>>,
    transport: Arc<dyn GroupTransport>,
    ledger: Arc<LedgerDb>,
    roster: Roster,
    // Separate from the roster so status reads never wait on a join or leave.
    active: RwLock<bool>,
    // Held for the whole of join/leave; owns the heartbeat lifecycle.
    lifecycle: Mutex<Option<TaskScope>>,
    options: MembershipOptions,
}

/// Handle to the local agent's group membership. Cloning is cheap.
#[derive(Clone)]
pub struct MembershipManager {
    inner: Arc<Inner>,
}

impl MembershipManager {
    pub fn new(
        group_name: impl Into<String>,
        identity: AgentIdentity,
        transport: Arc<dyn GroupTransport>,
        ledger: Arc<LedgerDb>,
        options: MembershipOptions,
    ) -> Self {
        let group_name = group_name.into();
        Self {
            inner: Arc::new(Inner {
                topics: TopicNames::for_group(&group_name),
                group_name,
                identity,
                joined_identity: RwLock::new(None),
                transport,
                ledger,
                roster: Roster::new(),
                active: RwLock::new(false),
                lifecycle: Mutex::new(None),
                options,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.identity.agent_id
    }

    pub fn group_name(&self) -> &str {
        &self.inner.group_name
    }

    pub fn topics(&self) -> &TopicNames {
        &self.inner.topics
    }

    pub fn options(&self) -> MembershipOptions {
        self.inner.options
    }

    pub fn is_active(&self) -> bool {
        *self
            .inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active(&self, active: bool) {
        *self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = active;
    }

    /// The identity announced by the current membership, or the configured
    /// one while detached.
    pub fn identity(&self) -> AgentIdentity {
        self.inner
            .joined_identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.inner.identity.clone())
    }

    /// Copy of the roster, ordered by agent id.
    pub fn members(&self) -> Vec<GroupMember> {
        self.inner.roster.snapshot()
    }

    pub fn member(&self, agent_id: &str) -> Option<GroupMember> {
        self.inner.roster.get(agent_id)
    }

    pub fn member_count(&self) -> usize {
        self.inner.roster.len()
    }

    /// Members as recorded in the store, including this agent while active.
    pub async fn persisted_members(&self) -> Result<Vec<GroupMember>, LedgerError> {
        self.inner.ledger.list_members().await
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            active: self.is_active(),
            group_name: self.inner.group_name.clone(),
            agent_id: self.agent_id().to_string(),
            member_count: self.member_count(),
            topics: self.inner.topics.all(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Announce this agent to the group and start heartbeating.
    ///
    /// If the announce cannot be published nothing changes.
    pub async fn join(&self) -> Result<(), MembershipError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.is_active() {
            return Err(MembershipError::AlreadyActive);
        }

        let identity = self.inner.identity.rejoined();
        let timeout = self.inner.options.join_timeout;
        let announce = Payload::Announce(AnnouncePayload {
            action: AnnounceAction::Join,
            identity: identity.clone(),
        });
        match tokio::time::timeout(timeout, self.send(format!("join-{}", nanos()), announce)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MembershipError::Timeout(timeout)),
        }

        let me = GroupMember::from_identity(&identity, Utc::now());
        if let Err(e) = self.inner.ledger.upsert_member(&me).await {
            warn!(agent_id = %me.agent_id, error = %e, "failed to persist self in roster store");
        }
        *self
            .inner
            .joined_identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
        self.set_active(true);

        let mut scope = TaskScope::new("membership");
        let signal = scope.signal();
        scope.spawn(self.clone().heartbeat_loop(signal.clone()));
        scope.spawn(self.clone().stale_sweep_loop(signal));
        *lifecycle = Some(scope);

        info!(
            group = %self.inner.group_name,
            agent_id = %self.agent_id(),
            heartbeat_secs = self.inner.options.heartbeat_interval.as_secs_f64(),
            "joined group"
        );
        Ok(())
    }

    /// Stop heartbeating, announce departure and forget the roster.
    ///
    /// A failed leave announce is logged; the local state is reset anyway.
    pub async fn leave(&self) -> Result<(), MembershipError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_active() {
            return Err(MembershipError::NotActive);
        }

        if let Some(scope) = lifecycle.take() {
            scope.cancel_now();
        }
        // Inactive before the leave announce, so no heartbeat can follow it.
        self.set_active(false);

        let timeout = self.inner.options.leave_timeout;
        let announce = Payload::Announce(AnnouncePayload {
            action: AnnounceAction::Leave,
            identity: self.identity(),
        });
        match tokio::time::timeout(timeout, self.send(format!("leave-{}", nanos()), announce)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to publish leave announce"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "leave announce timed out"),
        }

        if let Err(e) = self.inner.ledger.remove_member(self.agent_id()).await {
            warn!(error = %e, "failed to remove self from roster store");
        }
        self.inner.roster.clear();
        global_metrics().set_gauge(names::ROSTER_SIZE, 0);

        info!(group = %self.inner.group_name, agent_id = %self.agent_id(), "left group");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound announces
    // -----------------------------------------------------------------------

    /// Apply a peer's announce to the roster.
    ///
    /// A `join` is answered with an immediate heartbeat so the newcomer
    /// learns about this agent without waiting a full interval.
    pub async fn handle_announce(&self, envelope: &GroupEnvelope) {
        if envelope.sender_id == self.agent_id() {
            debug!("ignoring own announce");
            return;
        }
        let Payload::Announce(announce) = &envelope.payload else {
            debug!(kind = %envelope.kind(), "not an announce");
            return;
        };
        let peer = &announce.identity;
        if peer.agent_id.is_empty() {
            warn!(sender = %envelope.sender_id, "announce without agent id");
            return;
        }

        match announce.action {
            AnnounceAction::Join | AnnounceAction::Heartbeat => {
                let member = GroupMember::from_identity(peer, Utc::now());
                let is_new = self.inner.roster.upsert(member.clone());
                if let Err(e) = self.inner.ledger.upsert_member(&member).await {
                    warn!(agent_id = %member.agent_id, error = %e, "failed to persist member");
                }
                if is_new {
                    info!(agent_id = %member.agent_id, name = %member.agent_name, "member discovered");
                } else {
                    debug!(agent_id = %member.agent_id, "member refreshed");
                }
                if announce.action == AnnounceAction::Join {
                    tokio::spawn(self.clone().send_heartbeat());
                }
            }
            AnnounceAction::Leave => {
                self.inner.roster.remove(&peer.agent_id);
                if let Err(e) = self.inner.ledger.remove_member(&peer.agent_id).await {
                    warn!(agent_id = %peer.agent_id, error = %e, "failed to remove member");
                }
                info!(agent_id = %peer.agent_id, "member left");
            }
        }
        global_metrics().set_gauge(names::ROSTER_SIZE, self.member_count() as i64);
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    async fn heartbeat_loop(self, signal: ShutdownSignal) {
        let period = self.inner.options.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => self.clone().send_heartbeat().await,
            }
        }
        debug!("heartbeat loop stopped");
    }

    async fn stale_sweep_loop(self, signal: ShutdownSignal) {
        let period = self.inner.options.stale_window();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_stale().await;
                }
            }
        }
        debug!("stale sweep stopped");
    }

    /// Publish one heartbeat. Does nothing while detached.
    ///
    /// Holds the lifecycle lock so a heartbeat never interleaves with a
    /// leave announce.
    async fn send_heartbeat(self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_active() {
            return;
        }
        let identity = self.identity();
        let announce = Payload::Announce(AnnouncePayload {
            action: AnnounceAction::Heartbeat,
            identity: identity.clone(),
        });
        match self.send(format!("hb-{}", nanos()), announce).await {
            Ok(()) => {
                global_metrics().increment_counter(names::HEARTBEATS_SENT, &[]);
                // Keep our own row out of the stale sweep.
                let me = GroupMember::from_identity(&identity, Utc::now());
                if let Err(e) = self.inner.ledger.upsert_member(&me).await {
                    debug!(error = %e, "failed to refresh self in roster store");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat publish failed"),
        }
    }

    /// Mark members silent for longer than the stale window as `stale`, in
    /// the store and in memory. Nothing is deleted.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let cutoff = stale_cutoff(Utc::now(), self.inner.options.stale_window());
        let mut flipped = match self.inner.ledger.mark_stale_members(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "stale sweep of roster store failed");
                Vec::new()
            }
        };
        for id in self.inner.roster.mark_stale_before(cutoff) {
            if !flipped.contains(&id) {
                flipped.push(id);
            }
        }
        if !flipped.is_empty() {
            info!(members = ?flipped, "members marked stale");
        }
        flipped
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    async fn send(&self, correlation_id: String, payload: Payload) -> Result<(), TransportError> {
        let envelope = GroupEnvelope::new(self.agent_id(), correlation_id, payload);
        let topic = self.inner.topics.for_kind(envelope.kind());
        publish_envelope(self.inner.transport.as_ref(), topic, &envelope).await
    }

    /// Publish on behalf of an active member.
    pub(crate) async fn publish(
        &self,
        correlation_id: String,
        payload: Payload,
    ) -> Result<(), MembershipError> {
        if !self.is_active() {
            return Err(MembershipError::NotActive);
        }
        self.send(correlation_id, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl TracePublisher for MembershipManager {
    /// Spans are only shared while active; otherwise this is a no-op.
    async fn publish_trace(&self, trace: TracePayload) -> Result<(), MembershipError> {
        if !self.is_active() {
            return Ok(());
        }
        let correlation_id = trace.trace_id.clone();
        self.send(correlation_id, Payload::Trace(trace)).await?;
        Ok(())
    }
}

fn nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn stale_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_window_is_three_intervals() {
        let opts = MembershipOptions {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
        };
        assert_eq!(opts.stale_window(), Duration::from_secs(90));
    }

    #[test]
    fn options_follow_group_config() {
        let cfg = GroupConfig {
            poll_interval_ms: 1000,
            heartbeat_interval_secs: None,
            ..GroupConfig::default()
        };
        let opts = MembershipOptions::from_config(&cfg);
        assert_eq!(opts.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn huge_window_clamps_cutoff() {
        let now = Utc::now();
        assert_eq!(stale_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert!(stale_cutoff(now, Duration::from_secs(1)) < now);
    }
}
