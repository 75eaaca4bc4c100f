//! Contexts handed to drivers: per-operation addressing and per-task dependencies.

use std::fmt;
use std::sync::Arc;

use crate::allocdir::TaskDir;
use crate::config::{AgentConfig, EVENT_SINK_KEY};
use crate::env::TaskEnvironment;
use crate::node::Node;
use crate::observability::{NoopEventSink, TaskEvent, TaskEventSink, create_event_sink};

/// Where a task's operations take place: its directory layout and allocation.
///
/// Immutable once built; every driver operation for one task instance reads
/// the same context.
#[derive(Debug, Clone)]
pub struct ExecContext {
    task_dir: Arc<TaskDir>,
    alloc_id: String,
}

impl ExecContext {
    pub fn new(task_dir: TaskDir, alloc_id: impl Into<String>) -> Self {
        Self {
            task_dir: Arc::new(task_dir),
            alloc_id: alloc_id.into(),
        }
    }

    pub fn task_dir(&self) -> &TaskDir {
        &self.task_dir
    }

    pub fn alloc_id(&self) -> &str {
        &self.alloc_id
    }
}

/// Dependencies injected into a driver when it is constructed.
///
/// Built once per task with [`DriverContext::new`] plus the `with_*`
/// builders, then handed to the driver factory. There are no mutators after
/// construction; drivers only read through the accessors.
#[derive(Clone)]
pub struct DriverContext {
    task_name: String,
    config: Arc<AgentConfig>,
    node: Arc<Node>,
    span: tracing::Span,
    task_env: Option<Arc<TaskEnvironment>>,
    events: Arc<dyn TaskEventSink>,
}

impl DriverContext {
    /// Context for `task_name` with no computed environment. The event sink
    /// is chosen by the `events.backend` option.
    pub fn new(task_name: impl Into<String>, config: Arc<AgentConfig>, node: Arc<Node>) -> Self {
        let task_name = task_name.into();
        let events = create_event_sink(&config.read_default(EVENT_SINK_KEY, "noop"));
        Self {
            span: tracing::info_span!("task", task = %task_name),
            task_name,
            config,
            node,
            task_env: None,
            events,
        }
    }

    /// Context with every field at its zero value.
    ///
    /// Enough to ask a driver for its static descriptors (abilities, isolation).
    pub fn empty() -> Self {
        Self {
            task_name: String::new(),
            config: Arc::new(AgentConfig::default()),
            node: Arc::new(Node::default()),
            span: tracing::Span::none(),
            task_env: None,
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn with_task_env(mut self, task_env: TaskEnvironment) -> Self {
        self.task_env = Some(Arc::new(task_env));
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn TaskEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the default `task` span, e.g. to parent it under an allocation span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Span that driver-spawned background work is instrumented with.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn task_env(&self) -> Option<&TaskEnvironment> {
        self.task_env.as_deref()
    }

    /// Emit a task event through the injected sink.
    pub fn emit_event(&self, message: impl Into<String>) {
        self.events
            .emit(&TaskEvent::new(self.task_name.as_str(), message));
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("task_name", &self.task_name)
            .field("node", &self.node.id)
            .field("has_task_env", &self.task_env.is_some())
            .field("events", &self.events.name())
            .finish()
    }
}
