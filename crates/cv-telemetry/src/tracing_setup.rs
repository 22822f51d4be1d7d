use uuid::Uuid;

/// Generate a trace id (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span id (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// A `tracing` span covering one admitted task.
pub fn task_span(task_id: &str, trace_id: &str, channel: &str) -> tracing::Span {
    tracing::info_span!(
        "task",
        task_id = %task_id,
        trace_id = %trace_id,
        channel = %channel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_span_id());
    }

    #[test]
    fn task_span_enters() {
        let span = task_span("t1", &generate_trace_id(), "group");
        let _guard = span.enter();
    }
}
