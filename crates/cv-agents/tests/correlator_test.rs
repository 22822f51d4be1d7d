//! Trace graph reconstruction across local and remote spans.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::ledger;
use cv_agents::correlator::TraceCorrelator;
use cv_bridge::protocol::TracePayload;
use cv_core::types::{NewSpan, NewTask, TaskStatus, TraceEdge};

enum Source {
    Local(NewSpan),
    Remote(TracePayload, &'static str),
}

fn spans() -> Vec<Source> {
    let t0 = Utc::now();
    let local_root = NewSpan {
        trace_id: "tr-1".into(),
        span_id: Some("root".into()),
        span_type: "TASK".into(),
        title: "fan out".into(),
        started_at: Some(t0),
        ..NewSpan::default()
    };
    let remote = |span: &str, parent: Option<&str>, offset: i64| TracePayload {
        trace_id: "tr-1".into(),
        span_id: Some(span.into()),
        parent_span_id: parent.map(str::to_string),
        span_type: "TASK".into(),
        title: format!("remote {span}"),
        content: String::new(),
        started_at: Some(t0 + ChronoDuration::milliseconds(offset)),
        ended_at: None,
        duration_ms: 5,
    };
    vec![
        Source::Local(local_root),
        Source::Remote(remote("b-work", Some("root"), 10), "b1"),
        Source::Remote(remote("c-work", Some("root"), 20), "c1"),
        Source::Remote(remote("c-tool", Some("c-work"), 30), "c1"),
        // Independent contribution: its parent is unknown here.
        Source::Remote(remote("d-work", Some("elsewhere"), 40), "d1"),
    ]
}

async fn record(correlator: &TraceCorrelator, sources: Vec<Source>) {
    for source in sources {
        match source {
            Source::Local(span) => {
                correlator.record_local_span(span).await.unwrap();
            }
            Source::Remote(payload, agent) => {
                correlator.record_remote_span(&payload, agent).await.unwrap();
            }
        }
    }
}

#[tokio::test]
async fn test_graph_is_independent_of_recording_order() {
    let forward = TraceCorrelator::new(ledger().await);
    record(&forward, spans()).await;

    let backward = TraceCorrelator::new(ledger().await);
    let mut reversed = spans();
    reversed.reverse();
    record(&backward, reversed).await;

    let g1 = forward.build_graph("tr-1").await.unwrap();
    let g2 = backward.build_graph("tr-1").await.unwrap();

    assert_eq!(g1.edges, g2.edges);
    assert_eq!(g1.roots, g2.roots);
    assert_eq!(
        g1.nodes.iter().map(|n| &n.id).collect::<Vec<_>>(),
        g2.nodes.iter().map(|n| &n.id).collect::<Vec<_>>()
    );

    assert_eq!(g1.nodes.len(), 5);
    let edge = |source: &str, target: &str| TraceEdge {
        source: source.into(),
        target: target.into(),
    };
    assert_eq!(
        g1.edges,
        vec![
            edge("c-work", "c-tool"),
            edge("root", "b-work"),
            edge("root", "c-work"),
        ]
    );
    assert_eq!(g1.roots.len(), 2);
    assert!(g1.roots.contains(&"local:root".to_string()));
    assert!(g1.roots.contains(&"d1:d-work".to_string()));
}

#[tokio::test]
async fn test_graph_carries_task_summary() {
    let db = ledger().await;
    let correlator = TraceCorrelator::new(db.clone());
    let task = db
        .create_task(NewTask::new("cli", "c").with_trace_id("tr-2"))
        .await
        .unwrap();
    db.update_task_status(&task.task_id, TaskStatus::Processing, None, None)
        .await
        .unwrap();
    db.add_token_usage(&task.task_id, 7, 3).await.unwrap();

    correlator
        .record_local_span(NewSpan {
            trace_id: "tr-2".into(),
            span_id: Some("s".into()),
            agent_id: "ignored".into(),
            ..NewSpan::default()
        })
        .await
        .unwrap();

    let graph = correlator.build_graph("tr-2").await.unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert_eq!(graph.nodes[0].agent_id, "local");
    let summary = graph.task.unwrap();
    assert_eq!(summary.task_id, task.task_id);
    assert_eq!(summary.status, TaskStatus::Processing);
    assert_eq!(summary.usage.total_tokens, 10);

    let empty = correlator.build_graph("nothing-here").await.unwrap();
    assert!(empty.nodes.is_empty());
    assert!(empty.task.is_none());
}
