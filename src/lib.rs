//! Task driver plugin contract and resource reclamation for a workload agent.
//!
//! Every execution backend implements [`driver::Driver`]. The agent resolves a
//! backend by name from a [`driver::DriverRegistry`], computes the task's
//! environment with [`env::get_task_env`], then drives the backend through a
//! [`runner::TaskRunner`], which persists the [`driver::CreatedResources`]
//! ledger so cleanup survives restarts.

pub mod allocdir;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod fingerprint;
pub mod node;
pub mod observability;
pub mod runner;
pub mod task;

pub use config::AgentConfig;
pub use driver::{
    BUILTIN_DRIVERS, CreatedResources, Driver, DriverAbilities, DriverContext, DriverHandle,
    DriverRegistry, ExecContext, FsIsolation, new_driver,
};
pub use env::{TaskEnvironment, get_task_env};
pub use error::{DriverError, DriverErrorKind, Error, PrepareError};
pub use runner::{CleanupRetryConfig, TaskRunner, TaskState};
