use std::fmt;

use chrono::{DateTime, Utc};
use cv_core::types::{AgentIdentity, ResponseStatus};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Envelope kinds and topics
// ---------------------------------------------------------------------------

/// Discriminator carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Announce,
    Request,
    Response,
    Trace,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Announce => "announce",
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Trace => "trace",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "announce" => Some(EnvelopeKind::Announce),
            "request" => Some(EnvelopeKind::Request),
            "response" => Some(EnvelopeKind::Response),
            "trace" => Some(EnvelopeKind::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four topics of one group. Each message class gets its own ordered
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub announce: String,
    pub requests: String,
    pub responses: String,
    pub traces: String,
}

impl TopicNames {
    pub fn for_group(group_name: &str) -> Self {
        Self {
            announce: format!("group.{group_name}.announce"),
            requests: format!("group.{group_name}.requests"),
            responses: format!("group.{group_name}.responses"),
            traces: format!("group.{group_name}.traces"),
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.announce.clone(),
            self.requests.clone(),
            self.responses.clone(),
            self.traces.clone(),
        ]
    }

    pub fn for_kind(&self, kind: EnvelopeKind) -> &str {
        match kind {
            EnvelopeKind::Announce => &self.announce,
            EnvelopeKind::Request => &self.requests,
            EnvelopeKind::Response => &self.responses,
            EnvelopeKind::Trace => &self.traces,
        }
    }

    /// Which message class a topic of this group carries.
    pub fn kind_of(&self, topic: &str) -> Option<EnvelopeKind> {
        if topic == self.announce {
            Some(EnvelopeKind::Announce)
        } else if topic == self.requests {
            Some(EnvelopeKind::Request)
        } else if topic == self.responses {
            Some(EnvelopeKind::Response)
        } else if topic == self.traces {
            Some(EnvelopeKind::Trace)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceAction {
    Join,
    Leave,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub action: AnnounceAction,
    pub identity: AgentIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    pub task_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    pub requester_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponsePayload {
    pub task_id: String,
    pub responder_id: String,
    #[serde(default)]
    pub content: String,
    pub status: ResponseStatus,
}

/// One span shared with the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePayload {
    pub trace_id: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub span_id: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub span_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: i64,
}

fn empty_as_none<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(d)?.filter(|s| !s.is_empty()))
}

/// Missing, empty or unparsable timestamps become `None`.
fn lenient_timestamp<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }))
}

/// The typed body of an envelope, one variant per `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Announce(AnnouncePayload),
    Request(TaskRequestPayload),
    Response(TaskResponsePayload),
    Trace(TracePayload),
}

impl Payload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::Announce(_) => EnvelopeKind::Announce,
            Payload::Request(_) => EnvelopeKind::Request,
            Payload::Response(_) => EnvelopeKind::Response,
            Payload::Trace(_) => EnvelopeKind::Trace,
        }
    }

    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Payload::Announce(p) => serde_json::to_value(p),
            Payload::Request(p) => serde_json::to_value(p),
            Payload::Response(p) => serde_json::to_value(p),
            Payload::Trace(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: EnvelopeKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EnvelopeKind::Announce => Payload::Announce(serde_json::from_value(value)?),
            EnvelopeKind::Request => Payload::Request(serde_json::from_value(value)?),
            EnvelopeKind::Response => Payload::Response(serde_json::from_value(value)?),
            EnvelopeKind::Trace => Payload::Trace(serde_json::from_value(value)?),
        })
    }
}

// ---------------------------------------------------------------------------
// GroupEnvelope
// ---------------------------------------------------------------------------

/// The wire unit for all group traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEnvelope {
    pub correlation_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl GroupEnvelope {
    pub fn new(
        sender_id: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    correlation_id: String,
    sender_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown envelope type: {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: EnvelopeKind,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Short label used when counting dropped envelopes.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::Payload { .. } => "bad_payload",
        }
    }
}

/// Serialize an envelope to JSON bytes.
pub fn encode(envelope: &GroupEnvelope) -> serde_json::Result<Vec<u8>> {
    let wire = WireEnvelope {
        kind: envelope.kind().as_str().to_string(),
        correlation_id: envelope.correlation_id.clone(),
        sender_id: envelope.sender_id.clone(),
        timestamp: envelope.timestamp,
        payload: envelope.payload.to_value()?,
    };
    serde_json::to_vec(&wire)
}

/// Parse JSON bytes into an envelope, selecting the payload shape by `type`.
pub fn decode(bytes: &[u8]) -> Result<GroupEnvelope, DecodeError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let kind = EnvelopeKind::parse(&wire.kind).ok_or(DecodeError::UnknownType(wire.kind))?;
    let payload = Payload::from_value(kind, wire.payload)
        .map_err(|source| DecodeError::Payload { kind, source })?;
    Ok(GroupEnvelope {
        correlation_id: wire.correlation_id,
        sender_id: wire.sender_id,
        timestamp: wire.timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_derived_from_group_name() {
        let t = TopicNames::for_group("ops");
        assert_eq!(t.announce, "group.ops.announce");
        assert_eq!(t.traces, "group.ops.traces");
        assert_eq!(t.kind_of("group.ops.requests"), Some(EnvelopeKind::Request));
        assert_eq!(t.kind_of("group.other.requests"), None);
        assert_eq!(t.for_kind(EnvelopeKind::Response), "group.ops.responses");
        assert_eq!(t.all().len(), 4);
    }

    #[test]
    fn wire_shape_is_flat_json() {
        let env = GroupEnvelope::new(
            "a1",
            "T1",
            Payload::Request(TaskRequestPayload {
                task_id: "T1".into(),
                description: "d".into(),
                content: "c".into(),
                requester_id: "a1".into(),
            }),
        );
        let v: serde_json::Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["sender_id"], "a1");
        assert_eq!(v["payload"]["task_id"], "T1");
        assert_eq!(decode(&encode(&env).unwrap()).unwrap(), env);
    }
}
