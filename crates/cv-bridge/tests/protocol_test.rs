use cv_bridge::protocol::*;
use cv_core::types::{AgentIdentity, ResponseStatus};

#[test]
fn announce_carries_full_identity() {
    let identity = AgentIdentity::new("a1", "Alpha")
        .with_capabilities(["search"])
        .with_channels(["telegram"])
        .with_model("m-1");
    let env = GroupEnvelope::new(
        "a1",
        "join-1",
        Payload::Announce(AnnouncePayload {
            action: AnnounceAction::Join,
            identity: identity.clone(),
        }),
    );
    let bytes = encode(&env).unwrap();
    let back = decode(&bytes).unwrap();
    assert_eq!(back.kind(), EnvelopeKind::Announce);
    match back.payload {
        Payload::Announce(p) => {
            assert_eq!(p.action, AnnounceAction::Join);
            assert_eq!(p.identity, identity);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn garbage_is_malformed() {
    let err = decode(b"not json").unwrap_err();
    assert!(matches!(err, DecodeError::Malformed(_)));
    assert_eq!(err.reason(), "malformed");
}

#[test]
fn unknown_type_is_rejected() {
    let raw = br#"{"type":"gossip","correlation_id":"c","sender_id":"b1",
        "timestamp":"2026-01-01T00:00:00Z","payload":{}}"#;
    let err = decode(raw).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "gossip"));
}

#[test]
fn payload_must_match_type() {
    let raw = br#"{"type":"response","correlation_id":"c","sender_id":"b1",
        "timestamp":"2026-01-01T00:00:00Z","payload":{"action":"join"}}"#;
    let err = decode(raw).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Payload {
            kind: EnvelopeKind::Response,
            ..
        }
    ));
}

#[test]
fn response_status_is_typed() {
    let raw = br#"{"type":"response","correlation_id":"T1","sender_id":"b1",
        "timestamp":"2026-01-01T00:00:00Z",
        "payload":{"task_id":"T1","responder_id":"b1","content":"ok","status":"rejected"}}"#;
    match decode(raw).unwrap().payload {
        Payload::Response(p) => assert_eq!(p.status, ResponseStatus::Rejected),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn trace_payload_tolerates_empty_fields() {
    let raw = br#"{"type":"trace","correlation_id":"t1","sender_id":"b1",
        "timestamp":"2026-01-01T00:00:00Z",
        "payload":{"trace_id":"t1","span_id":"s2","parent_span_id":"",
            "span_type":"TASK","title":"x","content":"","started_at":"",
            "ended_at":"2026-01-01T00:00:05Z","duration_ms":5000}}"#;
    match decode(raw).unwrap().payload {
        Payload::Trace(p) => {
            assert_eq!(p.span_id.as_deref(), Some("s2"));
            assert!(p.parent_span_id.is_none());
            assert!(p.started_at.is_none());
            assert!(p.ended_at.is_some());
            assert_eq!(p.duration_ms, 5000);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}
