//! Test-only sink that captures every event into a shared vector.

use std::sync::{Arc, Mutex};

use crate::observability::traits::{TaskEvent, TaskEventSink};

/// Sink that records all events for test assertions.
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl RecordingEventSink {
    /// Create a new recording sink and return a handle to the captured events.
    pub fn new() -> (Self, Arc<Mutex<Vec<TaskEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl TaskEventSink for RecordingEventSink {
    fn emit(&self, event: &TaskEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_events() {
        let (sink, events) = RecordingEventSink::new();

        sink.emit(&TaskEvent::new("web", "first"));
        sink.emit(&TaskEvent::new("web", "second"));

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[1].message, "second");
    }
}
