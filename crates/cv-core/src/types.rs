use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Agent id recorded on spans produced by this process.
pub const LOCAL_AGENT_ID: &str = "local";

/// Channel name used for work that arrives through the group.
pub const GROUP_CHANNEL: &str = "group";

// ---------------------------------------------------------------------------
// Text-backed enums
// ---------------------------------------------------------------------------

/// Returned when a stored or wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// MemberStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Active,
    Stale,
}

text_enum!(MemberStatus, "member status", {
    Active => "active",
    Stale => "stale",
});

// ---------------------------------------------------------------------------
// AgentIdentity
// ---------------------------------------------------------------------------

/// Peers may send `null` for an empty list.
fn null_as_empty<'de, D>(d: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeSet<String>>::deserialize(d)?.unwrap_or_default())
}

/// Self-description of one participant, broadcast on every announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub soul_summary: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub capabilities: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub channels: BTreeSet<String>,
    #[serde(default)]
    pub model: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MemberStatus,
}

impl AgentIdentity {
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            soul_summary: String::new(),
            capabilities: BTreeSet::new(),
            channels: BTreeSet::new(),
            model: String::new(),
            joined_at: Utc::now(),
            status: MemberStatus::Active,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.soul_summary = summary.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// A copy stamped for a new join: fresh `joined_at`, status `active`.
    pub fn rejoined(&self) -> Self {
        Self {
            joined_at: Utc::now(),
            status: MemberStatus::Active,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// GroupMember
// ---------------------------------------------------------------------------

/// One roster entry as seen by the local agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: String,
    pub agent_name: String,
    pub soul_summary: String,
    pub capabilities: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub model: String,
    pub status: MemberStatus,
    pub last_seen: DateTime<Utc>,
}

impl GroupMember {
    /// Build a fresh `active` roster entry from an announced identity.
    pub fn from_identity(identity: &AgentIdentity, seen_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: identity.agent_id.clone(),
            agent_name: identity.agent_name.clone(),
            soul_summary: identity.soul_summary.clone(),
            capabilities: identity.capabilities.clone(),
            channels: identity.channels.clone(),
            model: identity.model.clone(),
            status: MemberStatus::Active,
            last_seen: seen_at,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus / DeliveryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

text_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Skipped => "skipped",
});

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// What kind of inbound unit a task was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    GroupRequest,
    GroupResponse,
}

text_enum!(MessageKind, "message kind", {
    Text => "text",
    GroupRequest => "group_request",
    GroupResponse => "group_response",
});

// ---------------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A ledger record for one admitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: i64,
    pub task_id: String,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub message_kind: MessageKind,
    pub status: TaskStatus,
    pub content_in: String,
    pub content_out: Option<String>,
    pub error_text: Option<String>,
    pub usage: TokenUsage,
    pub delivery_status: DeliveryStatus,
    pub delivery_attempts: i64,
    pub delivery_next_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for [`crate::ledger::LedgerDb::create_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Generated when absent.
    pub task_id: Option<String>,
    /// Empty keys are stored as NULL and never collide.
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub message_kind: MessageKind,
    pub content_in: String,
}

impl NewTask {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            ..Self::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content_in = content.into();
        self
    }
}

/// Filters for listing tasks. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub channel: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

// ---------------------------------------------------------------------------
// Group tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDirection {
    Outgoing,
    Incoming,
}

text_enum!(TaskDirection, "task direction", {
    Outgoing => "outgoing",
    Incoming => "incoming",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupTaskStatus {
    Pending,
    Completed,
    Failed,
    Rejected,
}

text_enum!(GroupTaskStatus, "group task status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
});

/// Outcome a responder reports for a group task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Failed,
    Rejected,
}

text_enum!(ResponseStatus, "response status", {
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
});

impl From<ResponseStatus> for GroupTaskStatus {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Completed => GroupTaskStatus::Completed,
            ResponseStatus::Failed => GroupTaskStatus::Failed,
            ResponseStatus::Rejected => GroupTaskStatus::Rejected,
        }
    }
}

/// A cooperative task shared with the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTaskRecord {
    pub id: i64,
    pub task_id: String,
    pub description: String,
    pub content: String,
    pub direction: TaskDirection,
    pub requester_id: String,
    pub responder_id: Option<String>,
    pub response_content: Option<String>,
    pub status: GroupTaskStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewGroupTask {
    pub task_id: String,
    pub description: String,
    pub content: String,
    pub direction: TaskDirection,
    pub requester_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct GroupTaskFilter {
    pub direction: Option<TaskDirection>,
    pub status: Option<GroupTaskStatus>,
    pub limit: Option<u32>,
    pub offset: u32,
}

// ---------------------------------------------------------------------------
// Spans and trace graphs
// ---------------------------------------------------------------------------

/// One stored span, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: i64,
    pub trace_id: String,
    /// [`LOCAL_AGENT_ID`] for spans produced by this process.
    pub agent_id: String,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub span_type: String,
    pub title: String,
    pub content: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSpan {
    pub trace_id: String,
    pub agent_id: String,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub span_type: String,
    pub title: String,
    pub content: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: String,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub span_type: String,
    pub title: String,
    pub agent_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub output: String,
}

/// Parent span id -> child span id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceEdge {
    pub source: String,
    pub target: String,
}

/// Summary of the ledger task that shares a trace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub delivery_status: DeliveryStatus,
    pub usage: TokenUsage,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&AgentTask> for TaskSummary {
    fn from(task: &AgentTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            delivery_status: task.delivery_status,
            usage: task.usage,
            channel: task.channel.clone(),
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceGraph {
    pub trace_id: String,
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
    /// Node ids with no resolvable parent.
    pub roots: Vec<String>,
    pub task: Option<TaskSummary>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
