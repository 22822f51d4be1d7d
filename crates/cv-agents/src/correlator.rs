use std::sync::Arc;

use cv_bridge::protocol::TracePayload;
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::trace_graph;
use cv_core::types::{NewSpan, TaskSummary, TraceGraph, LOCAL_AGENT_ID};

/// Ingests local and remote spans into one store and rebuilds trace graphs
/// from it on demand. Nothing here writes back into membership or intake.
#[derive(Clone)]
pub struct TraceCorrelator {
    ledger: Arc<LedgerDb>,
}

impl TraceCorrelator {
    pub fn new(ledger: Arc<LedgerDb>) -> Self {
        Self { ledger }
    }

    /// Store a span produced by this agent. The owner is always `"local"`.
    pub async fn record_local_span(&self, mut span: NewSpan) -> Result<bool, LedgerError> {
        span.agent_id = LOCAL_AGENT_ID.to_string();
        self.ledger.insert_span(span).await
    }

    /// Store a span published by `source_agent_id`. Returns `false` when the
    /// same span was already stored.
    pub async fn record_remote_span(
        &self,
        payload: &TracePayload,
        source_agent_id: &str,
    ) -> Result<bool, LedgerError> {
        self.ledger
            .insert_span(NewSpan {
                trace_id: payload.trace_id.clone(),
                agent_id: source_agent_id.to_string(),
                span_id: payload.span_id.clone(),
                parent_span_id: payload.parent_span_id.clone(),
                span_type: payload.span_type.clone(),
                title: payload.title.clone(),
                content: payload.content.clone(),
                started_at: payload.started_at,
                ended_at: payload.ended_at,
                duration_ms: payload.duration_ms,
            })
            .await
    }

    /// Rebuild the graph for `trace_id` from every stored span, with the
    /// summary of the first task that carries the same trace id.
    pub async fn build_graph(&self, trace_id: &str) -> Result<TraceGraph, LedgerError> {
        let spans = self.ledger.spans_for_trace(trace_id).await?;
        let mut graph = trace_graph::assemble(trace_id, &spans);
        graph.task = self
            .ledger
            .get_task_by_trace_id(trace_id)
            .await?
            .as_ref()
            .map(TaskSummary::from);
        Ok(graph)
    }
}

/// The wire form of a locally recorded span.
pub fn trace_payload(span: &NewSpan) -> TracePayload {
    TracePayload {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        parent_span_id: span.parent_span_id.clone(),
        span_type: span.span_type.clone(),
        title: span.title.clone(),
        content: span.content.clone(),
        started_at: span.started_at,
        ended_at: span.ended_at,
        duration_ms: span.duration_ms,
    }
}
