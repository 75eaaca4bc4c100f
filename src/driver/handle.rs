//! Handle contract for a running task, plus its exit and usage types.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::DriverError;
use crate::task::Task;

/// Live reference to a started or reattached task.
///
/// One caller at a time issues `update`/`kill`/`signal` for a given handle;
/// `wait_ch` may be awaited by any number of observers.
#[async_trait]
pub trait DriverHandle: Send + Sync {
    /// Opaque token that `Driver::open` accepts to reattach to this task.
    fn id(&self) -> String;

    /// A waiter that resolves once with the task's exit result.
    fn wait_ch(&self) -> ExitWaiter;

    /// Apply live-updatable changes (e.g. resource limits) without a restart.
    async fn update(&self, task: &Task) -> Result<(), DriverError>;

    /// Stop the task. Succeeds on a task that has already exited.
    async fn kill(&self) -> Result<(), DriverError>;

    /// Current resource usage. `NotImplemented` when the backend can't report it.
    async fn stats(&self) -> Result<TaskResourceUsage, DriverError>;

    /// Deliver `signal`. `NotImplemented` when the backend can't send signals.
    async fn signal(&self, signal: Signal) -> Result<(), DriverError>;
}

/// How a task exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResult {
    pub exit_code: i32,
    /// Terminating signal number, 0 if none.
    pub signal: i32,
    /// Error observed while waiting, if any.
    pub err: Option<String>,
}

impl WaitResult {
    pub fn new(exit_code: i32, signal: i32, err: Option<String>) -> Self {
        Self {
            exit_code,
            signal,
            err,
        }
    }

    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.err.is_none()
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code: {}, signal: {}", self.exit_code, self.signal)?;
        if let Some(err) = &self.err {
            write!(f, ", error: {err}")?;
        }
        Ok(())
    }
}

/// Create a connected notifier/waiter pair for one task's exit.
pub fn exit_channel() -> (ExitNotifier, ExitWaiter) {
    let (tx, rx) = watch::channel(None);
    (ExitNotifier { tx }, ExitWaiter { rx })
}

/// Publishing side of a task's exit. Consumed by [`ExitNotifier::notify`], so it
/// fires at most once.
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<Option<WaitResult>>,
}

impl ExitNotifier {
    pub fn notify(self, result: WaitResult) {
        self.tx.send_replace(Some(result));
    }
}

/// Observing side of a task's exit. Cheap to clone; every clone sees the same
/// result and waiting does not consume it.
#[derive(Debug, Clone)]
pub struct ExitWaiter {
    rx: watch::Receiver<Option<WaitResult>>,
}

impl ExitWaiter {
    /// Resolve with the exit result.
    ///
    /// If the notifier is dropped without firing, resolves with an error
    /// result rather than waiting forever.
    pub async fn wait(mut self) -> WaitResult {
        let observed = self
            .rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| (*result).clone());
        observed
            .or_else(|| self.rx.borrow().clone())
            .unwrap_or_else(lost_result)
    }

    /// The exit result if the task has already exited.
    pub fn try_result(&self) -> Option<WaitResult> {
        self.rx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

fn lost_result() -> WaitResult {
    WaitResult::new(-1, 0, Some("task exit was not observed".to_string()))
}

/// Signals a driver may be asked to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    /// Conventional name, e.g. `"SIGTERM"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Term => "SIGTERM",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Nix;
        match self {
            Signal::Hup => Nix::SIGHUP,
            Signal::Int => Nix::SIGINT,
            Signal::Quit => Nix::SIGQUIT,
            Signal::Kill => Nix::SIGKILL,
            Signal::Term => Nix::SIGTERM,
            Signal::Usr1 => Nix::SIGUSR1,
            Signal::Usr2 => Nix::SIGUSR2,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    /// Accepts `"SIGTERM"`, `"TERM"`, or `"term"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Signal::Hup),
            "INT" => Ok(Signal::Int),
            "QUIT" => Ok(Signal::Quit),
            "KILL" => Ok(Signal::Kill),
            "TERM" => Ok(Signal::Term),
            "USR1" => Ok(Signal::Usr1),
            "USR2" => Ok(Signal::Usr2),
            _ => Err(format!("unknown signal '{s}'")),
        }
    }
}

/// Memory usage sample. `measured` names the fields the backend filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub max_usage: u64,
    pub measured: Vec<String>,
}

/// CPU usage sample. `measured` names the fields the backend filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub system_mode: f64,
    pub user_mode: f64,
    pub total_ticks: f64,
    pub throttled_periods: u64,
    pub throttled_time: u64,
    pub percent: f64,
    pub measured: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuStats,
}

/// Aggregate usage of a task, optionally broken down per pid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    pub resource_usage: ResourceUsage,
    /// Unix timestamp in nanoseconds.
    pub timestamp: i64,
    pub pids: HashMap<String, ResourceUsage>,
}
