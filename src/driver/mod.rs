//! Driver contract, builtin backends, and the name-keyed driver registry.
//!
//! A driver runs one kind of workload (raw host processes, Docker
//! containers, ...) behind the uniform [`Driver`] / [`DriverHandle`]
//! contract:
//!
//! ```text
//! prepare ──▶ start ──▶ [stats / signal / update] ──▶ kill ──▶ cleanup
//!                 ▲
//!     open ───────┘  (reattach after an agent restart)
//! ```
//!
//! Drivers are resolved by name through a [`DriverRegistry`]. The process-wide
//! [`BUILTIN_DRIVERS`] registry is populated once and read-only afterwards.

pub mod config;
mod context;
pub mod docker;
mod handle;
pub mod mock;
#[cfg(unix)]
pub mod raw_exec;
mod resources;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::context::{DriverContext, ExecContext};
pub use self::handle::{
    CpuStats, DriverHandle, ExitNotifier, ExitWaiter, MemoryStats, ResourceUsage, Signal,
    TaskResourceUsage, WaitResult, exit_channel,
};
pub use self::resources::CreatedResources;
use crate::allocdir::TaskDir;
use crate::config::AgentConfig;
use crate::env::TaskEnvironment;
use crate::error::{DriverError, PrepareError};
use crate::fingerprint::Fingerprint;
use crate::node::Node;
use crate::task::{Allocation, Task};

/// Capabilities a driver declares up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverAbilities {
    /// Whether handles can deliver arbitrary signals to the task.
    pub send_signals: bool,
}

/// Filesystem isolation a driver provides to its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsIsolation {
    /// Tasks see the host filesystem.
    None,
    /// Tasks run in a chroot or similar; host paths are remapped.
    Process,
    /// Tasks run inside their own image.
    Image,
}

impl FsIsolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsIsolation::None => "none",
            FsIsolation::Process => "process",
            FsIsolation::Image => "image",
        }
    }
}

impl fmt::Display for FsIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle contract every backend implements.
///
/// Operations for a single task are issued by one caller at a time; a driver
/// instance may be shared across threads but is not required to serialize
/// concurrent lifecycle calls for the same task.
#[async_trait]
pub trait Driver: Fingerprint {
    /// Registry name of this driver.
    fn name(&self) -> &str;

    /// One-time, possibly expensive setup such as pulling an image.
    ///
    /// Returns `None` when nothing was created. On failure the error carries
    /// the resources created before the failure so the caller can clean them
    /// up. Safe to call again after a failure.
    async fn prepare(
        &self,
        ctx: &ExecContext,
        task: &Task,
    ) -> Result<Option<CreatedResources>, PrepareError>;

    /// Start the task. Must only be called after a successful `prepare`.
    async fn start(&self, ctx: &ExecContext, task: &Task)
    -> Result<Box<dyn DriverHandle>, DriverError>;

    /// Reattach to a running task by the id of a handle previously returned
    /// from `start`. Fails with [`DriverError::HandleNotFound`] when the task
    /// is gone.
    async fn open(&self, ctx: &ExecContext, handle_id: &str)
    -> Result<Box<dyn DriverHandle>, DriverError>;

    /// Reclaim resources named in `resources`.
    ///
    /// Entries are removed as they are reclaimed, so on a recoverable error
    /// `resources` holds exactly what is left. Resources that are already
    /// gone count as reclaimed, which makes retrying with the original
    /// ledger safe.
    async fn cleanup(
        &self,
        ctx: &ExecContext,
        resources: &mut CreatedResources,
    ) -> Result<(), DriverError>;

    /// Validate driver-specific task config without side effects.
    fn validate(&self, config: &Map<String, Value>) -> Result<(), DriverError>;

    fn abilities(&self) -> DriverAbilities;

    fn fs_isolation(&self) -> FsIsolation;
}

/// Builds a driver instance for one task.
pub type Factory = Arc<dyn Fn(DriverContext) -> Box<dyn Driver> + Send + Sync>;

/// Name-keyed driver constructors.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Factory>,
}

/// Registry with every builtin driver, built on first use.
pub static BUILTIN_DRIVERS: LazyLock<DriverRegistry> = LazyLock::new(DriverRegistry::builtin);

/// Construct a builtin driver by name.
pub fn new_driver(name: &str, ctx: DriverContext) -> Result<Box<dyn Driver>, DriverError> {
    BUILTIN_DRIVERS.new_driver(name, ctx)
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin drivers.
    pub fn builtin() -> Self {
        let registry = Self::new()
            .register(docker::DRIVER_NAME, |ctx| {
                Box::new(docker::DockerDriver::new(ctx)) as Box<dyn Driver>
            })
            .register(mock::DRIVER_NAME, |ctx| {
                Box::new(mock::MockDriver::new(ctx)) as Box<dyn Driver>
            });

        #[cfg(unix)]
        let registry = registry.register(raw_exec::DRIVER_NAME, |ctx| {
            Box::new(raw_exec::RawExecDriver::new(ctx)) as Box<dyn Driver>
        });

        registry
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(DriverContext) -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Construct the driver registered as `name`.
    pub fn new_driver(
        &self,
        name: &str,
        ctx: DriverContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DriverError::UnknownDriver(name.to_string()))?;
        Ok(factory(ctx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Compute the environment for `task`, resolving its driver in this registry.
    pub fn task_env(
        &self,
        task_dir: &TaskDir,
        node: &Node,
        task: &Task,
        alloc: Option<&Allocation>,
        config: &AgentConfig,
        vault_token: Option<SecretString>,
    ) -> Result<TaskEnvironment, DriverError> {
        crate::env::build_task_env(self, task_dir, node, task, alloc, config, vault_token)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
