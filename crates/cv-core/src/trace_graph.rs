//! Assembles a [`TraceGraph`] from stored spans.
//!
//! Edges are never stored. They are rebuilt on every call by joining each
//! span's `parent_span_id` to the `span_id` of another span in the same trace,
//! regardless of which agent produced either side.

use std::collections::{BTreeSet, HashSet};

use crate::types::{SpanRecord, TraceEdge, TraceGraph, TraceNode};

/// Stable node id for a span. Spans without a span id fall back to their row id.
pub fn node_id(span: &SpanRecord) -> String {
    match &span.span_id {
        Some(sid) => format!("{}:{}", span.agent_id, sid),
        None => format!("{}:row-{}", span.agent_id, span.id),
    }
}

/// Build the graph for `trace_id` from `spans`.
///
/// Spans belonging to another trace are ignored. The result does not depend
/// on the order of `spans`.
pub fn assemble(trace_id: &str, spans: &[SpanRecord]) -> TraceGraph {
    let spans: Vec<&SpanRecord> = spans.iter().filter(|s| s.trace_id == trace_id).collect();

    let known: HashSet<&str> = spans.iter().filter_map(|s| s.span_id.as_deref()).collect();

    let mut edges = BTreeSet::new();
    let mut roots = BTreeSet::new();
    let mut nodes: Vec<TraceNode> = Vec::with_capacity(spans.len());

    for span in &spans {
        let id = node_id(span);
        let parent = span
            .parent_span_id
            .as_deref()
            .filter(|p| known.contains(p) && span.span_id.as_deref() != Some(*p));

        match (parent, span.span_id.as_deref()) {
            (Some(p), Some(child)) => {
                edges.insert(TraceEdge {
                    source: p.to_string(),
                    target: child.to_string(),
                });
            }
            (Some(_), None) => {}
            (None, _) => {
                roots.insert(id.clone());
            }
        }

        nodes.push(TraceNode {
            id,
            span_id: span.span_id.clone(),
            parent_span_id: span.parent_span_id.clone(),
            span_type: span.span_type.clone(),
            title: span.title.clone(),
            agent_id: span.agent_id.clone(),
            started_at: span.started_at,
            ended_at: span.ended_at,
            duration_ms: span.duration_ms,
            output: span.content.clone(),
        });
    }

    nodes.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    nodes.dedup_by(|a, b| a.id == b.id);

    TraceGraph {
        trace_id: trace_id.to_string(),
        nodes,
        edges: edges.into_iter().collect(),
        roots: roots.into_iter().collect(),
        task: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn span(id: i64, agent: &str, sid: Option<&str>, parent: Option<&str>, offset: i64) -> SpanRecord {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        SpanRecord {
            id,
            trace_id: "t1".into(),
            agent_id: agent.into(),
            span_id: sid.map(Into::into),
            parent_span_id: parent.map(Into::into),
            span_type: "TASK".into(),
            title: format!("span {id}"),
            content: String::new(),
            started_at: Some(base + Duration::seconds(offset)),
            ended_at: None,
            duration_ms: 0,
            created_at: base,
        }
    }

    #[test]
    fn joins_parents_across_agents() {
        let spans = vec![
            span(1, "local", Some("s1"), None, 0),
            span(2, "b1", Some("s2"), Some("s1"), 1),
            span(3, "c1", Some("s3"), Some("s1"), 2),
        ];
        let graph = assemble("t1", &spans);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.roots, vec!["local:s1".to_string()]);
    }

    #[test]
    fn unresolvable_parent_makes_a_root() {
        let spans = vec![
            span(1, "a1", Some("s1"), Some("missing"), 0),
            span(2, "b1", Some("s2"), None, 1),
        ];
        let graph = assemble("t1", &spans);
        assert!(graph.edges.is_empty());
        assert_eq!(graph.roots, vec!["a1:s1".to_string(), "b1:s2".to_string()]);
    }

    #[test]
    fn self_parent_is_not_an_edge() {
        let graph = assemble("t1", &[span(1, "a1", Some("s1"), Some("s1"), 0)]);
        assert!(graph.edges.is_empty());
        assert_eq!(graph.roots.len(), 1);
    }

    #[test]
    fn span_without_id_uses_row_id() {
        let graph = assemble("t1", &[span(7, "local", None, None, 0)]);
        assert_eq!(graph.nodes[0].id, "local:row-7");
    }

    #[test]
    fn other_traces_are_ignored() {
        let mut other = span(9, "a1", Some("x"), None, 0);
        other.trace_id = "t2".into();
        let graph = assemble("t1", &[other]);
        assert!(graph.nodes.is_empty());
    }
}
