//! Task event sink trait and event type.

use chrono::{DateTime, Utc};

/// Destination for human-readable task events emitted by drivers
/// (e.g. "Downloading image redis:7").
///
/// Injected into drivers through the driver context so backends never reach
/// for ambient logging to report progress. Thread-safe and shared behind
/// `Arc<dyn TaskEventSink>`.
pub trait TaskEventSink: Send + Sync {
    /// Record a task event.
    fn emit(&self, event: &TaskEvent);

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// A single driver-emitted event about one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// Name of the task the event concerns.
    pub task: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Plain closures work as sinks.
impl<F> TaskEventSink for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn emit(&self, event: &TaskEvent) {
        self(event)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

/// Sink that discards every event.
pub struct NoopEventSink;

impl TaskEventSink for NoopEventSink {
    fn emit(&self, _event: &TaskEvent) {}

    fn name(&self) -> &str {
        "noop"
    }
}
