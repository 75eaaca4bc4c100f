//! Task event emission.
//!
//! Drivers report progress ("Downloading image ...") through an injected
//! [`TaskEventSink`] rather than global logging:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//! | `multi` | Fan-out to several sinks |
//!
//! Any `Fn(&TaskEvent) + Send + Sync` closure is also a sink.

mod log;
pub mod traits;

#[cfg(test)]
pub mod recording;

use std::sync::Arc;

pub use self::log::LogEventSink;
pub use self::traits::{NoopEventSink, TaskEvent, TaskEventSink};

/// Sink that forwards every event to each of its children in order.
pub struct MultiEventSink {
    sinks: Vec<Arc<dyn TaskEventSink>>,
}

impl MultiEventSink {
    pub fn new(sinks: Vec<Arc<dyn TaskEventSink>>) -> Self {
        Self { sinks }
    }
}

impl TaskEventSink for MultiEventSink {
    fn emit(&self, event: &TaskEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    fn name(&self) -> &str {
        "multi"
    }
}

/// Create a sink from a backend name.
///
/// Returns [`LogEventSink`] for "log" and [`NoopEventSink`] for "none",
/// "noop", or anything unrecognized.
pub fn create_event_sink(backend: &str) -> Arc<dyn TaskEventSink> {
    match backend {
        "log" => Arc::new(LogEventSink),
        _ => Arc::new(NoopEventSink),
    }
}
