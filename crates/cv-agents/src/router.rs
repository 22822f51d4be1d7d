//! Inbound side of the group.
//!
//! [`GroupRouter::run`] pulls raw records from every group topic, drops
//! malformed and self-originated envelopes, and dispatches the rest by
//! topic. A bad envelope never stops the loop; a transport read failure does.

use std::sync::Arc;

use cv_bridge::protocol::{decode, EnvelopeKind, GroupEnvelope, Payload, TopicNames};
use cv_bridge::transport::{GroupTransport, RawMessage, Subscription, TransportError};
use cv_bridge::work_queue::{InboundWork, WorkQueue};
use cv_core::ledger::LedgerDb;
use cv_core::types::{MessageKind, NewGroupTask, TaskDirection, GROUP_CHANNEL};
use cv_harness::shutdown::ShutdownSignal;
use cv_telemetry::metrics::{global_metrics, names};
use tracing::{debug, info, warn};

use crate::correlator::TraceCorrelator;
use crate::membership::MembershipManager;

/// Metadata keys attached to work that came from the group.
pub mod meta {
    pub const GROUP_TASK_ID: &str = "group_task_id";
    pub const GROUP_REQUESTER: &str = "group_requester";
    pub const GROUP_RESPONDER: &str = "group_responder";
    pub const GROUP_STATUS: &str = "group_status";
    pub const DESCRIPTION: &str = "description";
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("transport read failed: {0}")]
    Transport(#[from] TransportError),

    #[error("subscription closed by transport")]
    SubscriptionClosed,
}

/// Why an inbound record was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Decode(&'static str),
    SelfEcho,
    UnknownTopic,
    KindMismatch,
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            DropReason::Decode(reason) => reason,
            DropReason::SelfEcho => "self_echo",
            DropReason::UnknownTopic => "unknown_topic",
            DropReason::KindMismatch => "kind_mismatch",
        }
    }
}

/// What the router did with one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Announce,
    Enqueued { idempotency_key: String },
    Span { stored: bool },
    Dropped(DropReason),
}

pub struct GroupRouter {
    agent_id: String,
    topics: TopicNames,
    transport: Arc<dyn GroupTransport>,
    membership: MembershipManager,
    ledger: Arc<LedgerDb>,
    correlator: TraceCorrelator,
    queue: WorkQueue,
}

impl GroupRouter {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        membership: MembershipManager,
        ledger: Arc<LedgerDb>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            agent_id: membership.agent_id().to_string(),
            topics: membership.topics().clone(),
            transport,
            correlator: TraceCorrelator::new(ledger.clone()),
            membership,
            ledger,
            queue,
        }
    }

    /// Subscribe to every group topic.
    ///
    /// Subscribe before joining: peers answer a join immediately, and those
    /// replies are only seen by a subscription that already exists.
    pub async fn subscribe(&self) -> Result<Subscription, RouterError> {
        let subscription = self.transport.subscribe(&self.topics.all()).await?;
        debug!(agent_id = %self.agent_id, topics = ?self.topics.all(), "router subscribed");
        Ok(subscription)
    }

    /// Subscribe and route records until `shutdown` fires. Returns an error
    /// when the transport fails so the caller can restart with backoff.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), RouterError> {
        let subscription = self.subscribe().await?;
        self.route(subscription, shutdown).await
    }

    /// Route records from an existing subscription until `shutdown` fires.
    pub async fn route(
        &self,
        subscription: Subscription,
        shutdown: ShutdownSignal,
    ) -> Result<(), RouterError> {
        info!(agent_id = %self.agent_id, "router started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("router stopping");
                    return Ok(());
                }
                next = subscription.next() => next,
            };
            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(RouterError::SubscriptionClosed),
            };
            self.handle_raw(raw).await;
        }
    }

    /// Decode and dispatch one record. Bad records are dropped, never fatal.
    pub async fn handle_raw(&self, raw: RawMessage) -> Dispatch {
        let metrics = global_metrics();
        metrics.increment_counter(names::ENVELOPES_RECEIVED, &[]);

        let dispatch = match decode(&raw.value) {
            Ok(envelope) => self.dispatch(&raw.topic, envelope).await,
            Err(e) => {
                warn!(topic = %raw.topic, error = %e, "dropping undecodable envelope");
                Dispatch::Dropped(DropReason::Decode(e.reason()))
            }
        };
        if let Dispatch::Dropped(reason) = &dispatch {
            metrics.increment_counter(names::ENVELOPES_DROPPED, &[("reason", reason.label())]);
        }
        dispatch
    }

    async fn dispatch(&self, topic: &str, envelope: GroupEnvelope) -> Dispatch {
        if envelope.sender_id == self.agent_id {
            debug!(topic = %topic, "dropping own envelope");
            return Dispatch::Dropped(DropReason::SelfEcho);
        }
        let Some(expected) = self.topics.kind_of(topic) else {
            warn!(topic = %topic, "envelope on a topic outside this group");
            return Dispatch::Dropped(DropReason::UnknownTopic);
        };
        if expected != envelope.kind() {
            warn!(topic = %topic, kind = %envelope.kind(), "envelope type does not match topic");
            return Dispatch::Dropped(DropReason::KindMismatch);
        }
        debug!(topic = %topic, sender = %envelope.sender_id, kind = %expected, "routing envelope");

        match expected {
            EnvelopeKind::Announce => {
                self.membership.handle_announce(&envelope).await;
                Dispatch::Announce
            }
            EnvelopeKind::Request => self.on_request(envelope).await,
            EnvelopeKind::Response => self.on_response(envelope).await,
            EnvelopeKind::Trace => self.on_trace(envelope).await,
        }
    }

    async fn on_request(&self, envelope: GroupEnvelope) -> Dispatch {
        let Payload::Request(req) = envelope.payload else {
            return Dispatch::Dropped(DropReason::KindMismatch);
        };
        let recorded = self
            .ledger
            .insert_group_task(NewGroupTask {
                task_id: req.task_id.clone(),
                description: req.description.clone(),
                content: req.content.clone(),
                direction: TaskDirection::Incoming,
                requester_id: req.requester_id.clone(),
            })
            .await;
        if let Err(e) = recorded {
            warn!(task_id = %req.task_id, error = %e, "failed to record incoming group task");
        }

        let key = format!("group:{}", req.task_id);
        let work = InboundWork::new(GROUP_CHANNEL, &req.task_id, &req.requester_id, req.content)
            .with_trace_id(envelope.correlation_id)
            .with_idempotency_key(&key)
            .with_kind(MessageKind::GroupRequest)
            .with_metadata(meta::GROUP_TASK_ID, &req.task_id)
            .with_metadata(meta::GROUP_REQUESTER, &req.requester_id)
            .with_metadata(meta::DESCRIPTION, req.description);
        self.queue.submit(work).await;
        debug!(task_id = %req.task_id, requester = %req.requester_id, "group request enqueued");
        Dispatch::Enqueued { idempotency_key: key }
    }

    async fn on_response(&self, envelope: GroupEnvelope) -> Dispatch {
        let Payload::Response(resp) = envelope.payload else {
            return Dispatch::Dropped(DropReason::KindMismatch);
        };
        match self
            .ledger
            .update_group_task_response(
                &resp.task_id,
                TaskDirection::Outgoing,
                &resp.responder_id,
                &resp.content,
                resp.status.into(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %resp.task_id, "response to a task this agent did not submit"),
            Err(e) => warn!(task_id = %resp.task_id, error = %e, "failed to record group response"),
        }

        let key = format!("group-resp:{}:{}", resp.task_id, resp.responder_id);
        let content = format!(
            "[Task Response from {}] Status: {}\n{}",
            resp.responder_id, resp.status, resp.content
        );
        let work = InboundWork::new(GROUP_CHANNEL, &resp.task_id, &resp.responder_id, content)
            .with_trace_id(envelope.correlation_id)
            .with_idempotency_key(&key)
            .with_kind(MessageKind::GroupResponse)
            .with_metadata(meta::GROUP_TASK_ID, &resp.task_id)
            .with_metadata(meta::GROUP_RESPONDER, &resp.responder_id)
            .with_metadata(meta::GROUP_STATUS, resp.status.as_str());
        self.queue.submit(work).await;
        Dispatch::Enqueued { idempotency_key: key }
    }

    async fn on_trace(&self, envelope: GroupEnvelope) -> Dispatch {
        let Payload::Trace(trace) = &envelope.payload else {
            return Dispatch::Dropped(DropReason::KindMismatch);
        };
        match self
            .correlator
            .record_remote_span(trace, &envelope.sender_id)
            .await
        {
            Ok(stored) => {
                if !stored {
                    debug!(trace_id = %trace.trace_id, sender = %envelope.sender_id, "span already stored");
                }
                Dispatch::Span { stored }
            }
            Err(e) => {
                warn!(trace_id = %trace.trace_id, error = %e, "failed to store remote span");
                Dispatch::Span { stored: false }
            }
        }
    }
}
