//! Tracing-based sink that emits task events as structured log lines.

use crate::observability::traits::{TaskEvent, TaskEventSink};

/// Sink that logs every task event via `tracing`.
pub struct LogEventSink;

impl TaskEventSink for LogEventSink {
    fn emit(&self, event: &TaskEvent) {
        tracing::info!(
            task = event.task.as_str(),
            timestamp = %event.timestamp.to_rfc3339(),
            "task event: {}",
            event.message
        );
    }

    fn name(&self) -> &str {
        "log"
    }
}
