//! Task, allocation, and job descriptions handed to drivers.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default grace period between the interrupt and the hard kill.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A single schedulable unit of work executed by one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub name: String,
    /// Name of the driver that runs this task (e.g. "docker").
    pub driver: String,
    pub user: Option<String>,
    /// Driver-specific configuration, checked by `Driver::validate`.
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Task-declared environment variables. Values may use `${...}` interpolation.
    pub env: HashMap<String, String>,
    pub meta: HashMap<String, String>,
    pub resources: Option<Resources>,
    pub vault: Option<Vault>,
    pub kill_timeout: Duration,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: String::new(),
            user: None,
            config: serde_json::Map::new(),
            env: HashMap::new(),
            meta: HashMap::new(),
            resources: None,
            vault: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

impl Task {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            ..Self::default()
        }
    }

    /// Set one driver config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_vault(mut self, vault: Vault) -> Self {
        self.vault = Some(vault);
        self
    }
}

/// Resources reserved for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU shares in MHz.
    pub cpu: u32,
    pub memory_mb: u32,
    pub networks: Vec<NetworkResource>,
}

/// One network assignment with its ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkResource {
    pub ip: String,
    pub reserved_ports: Vec<Port>,
    pub dynamic_ports: Vec<Port>,
}

impl NetworkResource {
    /// All labelled ports, reserved first.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.reserved_ports.iter().chain(self.dynamic_ports.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub label: String,
    pub value: u16,
}

/// Secret-store integration declared by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vault {
    pub policies: Vec<String>,
    /// Whether the token is exposed to the task as `VAULT_TOKEN`.
    pub env: bool,
}

/// A job: the unit a user submits, made of task groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub name: String,
    pub meta: HashMap<String, String>,
    pub task_groups: Vec<TaskGroup>,
}

impl Job {
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// Meta for `task`, merged with precedence task > group > job.
    pub fn combined_task_meta(&self, group: &str, task: &str) -> HashMap<String, String> {
        let mut meta = self.meta.clone();
        if let Some(tg) = self.lookup_task_group(group) {
            meta.extend(tg.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(t) = tg.tasks.iter().find(|t| t.name == task) {
                meta.extend(t.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        meta
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskGroup {
    pub name: String,
    pub meta: HashMap<String, String>,
    pub tasks: Vec<Task>,
}

/// Placement of one task group instance on this node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocation {
    pub id: String,
    /// "<job>.<group>[<index>]".
    pub name: String,
    pub task_group: String,
    pub job: Job,
}

impl Allocation {
    /// Index parsed from the trailing `[N]` of the allocation name, or -1.
    pub fn index(&self) -> i64 {
        let Some(open) = self.name.rfind('[') else {
            return -1;
        };
        self.name[open + 1..]
            .strip_suffix(']')
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(-1)
    }
}
