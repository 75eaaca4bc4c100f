//! Runs a task as a plain host process with no isolation.
//!
//! Disabled unless the agent sets `driver.raw_exec.enable`. The process is
//! started in the task directory with stdout/stderr written to the log
//! directory, and is stopped with SIGINT followed by SIGKILL once the task's
//! kill timeout elapses.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::Instrument;

use super::config::{ConfigField, FieldKind, decode_config, validate_config};
use super::{
    CreatedResources, Driver, DriverAbilities, DriverContext, DriverHandle, ExitNotifier, ExitWaiter,
    ExecContext, FsIsolation, Signal, TaskResourceUsage, WaitResult, exit_channel,
};
use crate::config::AgentConfig;
use crate::error::{DriverError, PrepareError};
use crate::fingerprint::Fingerprint;
use crate::node::Node;
use crate::task::{DEFAULT_KILL_TIMEOUT, Task};

pub const DRIVER_NAME: &str = "raw_exec";

/// Option that must be true for the driver to fingerprint as available.
pub const ENABLE_OPTION: &str = "driver.raw_exec.enable";

/// How often a reattached process is probed for liveness.
const REATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONFIG_FIELDS: &[ConfigField] = &[
    ConfigField::required("command", FieldKind::String),
    ConfigField::optional("args", FieldKind::StringList),
];

#[derive(Debug, Deserialize)]
struct RawExecConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Serialized form of a raw_exec handle id.
#[derive(Debug, Serialize, Deserialize)]
struct RawExecHandleId {
    pid: i32,
    started_at: i64,
    /// Kernel start time of the process, used to detect pid reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_ticks: Option<u64>,
}

pub struct RawExecDriver {
    ctx: DriverContext,
}

impl RawExecDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    fn kill_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.ctx.config().max_kill_timeout)
    }
}

#[async_trait]
impl Fingerprint for RawExecDriver {
    async fn fingerprint(&self, config: &AgentConfig, node: &mut Node) -> Result<bool, DriverError> {
        let attribute = format!("driver.{DRIVER_NAME}");
        let enabled = config
            .read_bool_default(ENABLE_OPTION, false)
            .map_err(|e| DriverError::validation(DRIVER_NAME, ENABLE_OPTION, e.to_string()))?;
        if enabled {
            node.attributes.insert(attribute, "1".to_string());
        } else {
            node.attributes.remove(&attribute);
        }
        Ok(enabled)
    }
}

#[async_trait]
impl Driver for RawExecDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn prepare(
        &self,
        _ctx: &ExecContext,
        task: &Task,
    ) -> Result<Option<CreatedResources>, PrepareError> {
        validate_config(DRIVER_NAME, &task.config, CONFIG_FIELDS)?;
        Ok(None)
    }

    async fn start(
        &self,
        ctx: &ExecContext,
        task: &Task,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let config: RawExecConfig = decode_config(DRIVER_NAME, &task.config, CONFIG_FIELDS)?;
        let task_dir = ctx.task_dir();

        let (command, args) = match self.ctx.task_env() {
            Some(env) => (env.replace_env(&config.command), env.parse_and_replace(&config.args)),
            None => (config.command, config.args),
        };

        tokio::fs::create_dir_all(&task_dir.dir).await?;
        tokio::fs::create_dir_all(&task_dir.log_dir).await?;
        let stdout = std::fs::File::create(task_dir.log_dir.join(format!("{}.stdout.0", task.name)))?;
        let stderr = std::fs::File::create(task_dir.log_dir.join(format!("{}.stderr.0", task.name)))?;

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .current_dir(&task_dir.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(env) = self.ctx.task_env() {
            cmd.env_clear().envs(env.env_map());
        }

        let mut child = cmd.spawn().map_err(|e| DriverError::Start {
            reason: format!("failed to spawn {command}: {e}"),
            recoverable: false,
        })?;
        let pid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| DriverError::Start {
                reason: format!("{command} exited before its pid was observed"),
                recoverable: false,
            })?;

        let start_ticks = process_start_ticks(pid).await;
        tracing::info!(task = %task.name, alloc_id = %ctx.alloc_id(), pid, %command, "Started raw_exec task");

        let (notifier, waiter) = exit_channel();
        tokio::spawn(
            async move {
                let result = match child.wait().await {
                    Ok(status) => exit_result(status),
                    Err(e) => WaitResult::new(-1, 0, Some(e.to_string())),
                };
                tracing::debug!(pid, %result, "raw_exec task exited");
                notifier.notify(result);
            }
            .instrument(self.ctx.span().clone()),
        );

        Ok(Box::new(RawExecHandle {
            pid,
            started_at: Utc::now().timestamp(),
            start_ticks,
            kill_timeout: Mutex::new(self.kill_timeout(task.kill_timeout)),
            max_kill_timeout: self.ctx.config().max_kill_timeout,
            waiter,
        }))
    }

    async fn open(
        &self,
        _ctx: &ExecContext,
        handle_id: &str,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let id: RawExecHandleId =
            serde_json::from_str(handle_id).map_err(|e| DriverError::InvalidHandle {
                id: handle_id.to_string(),
                reason: e.to_string(),
            })?;
        if !is_alive(id.pid) {
            return Err(DriverError::HandleNotFound(handle_id.to_string()));
        }
        if let Some(expected) = id.start_ticks
            && process_start_ticks(id.pid).await != Some(expected)
        {
            tracing::warn!(pid = id.pid, "Pid now belongs to a different process");
            return Err(DriverError::HandleNotFound(handle_id.to_string()));
        }

        let (notifier, waiter) = exit_channel();
        tokio::spawn(poll_until_exit(id.pid, notifier).instrument(self.ctx.span().clone()));

        tracing::info!(pid = id.pid, "Reattached to raw_exec task");
        Ok(Box::new(RawExecHandle {
            pid: id.pid,
            started_at: id.started_at,
            start_ticks: id.start_ticks,
            kill_timeout: Mutex::new(self.kill_timeout(DEFAULT_KILL_TIMEOUT)),
            max_kill_timeout: self.ctx.config().max_kill_timeout,
            waiter,
        }))
    }

    async fn cleanup(
        &self,
        _ctx: &ExecContext,
        _resources: &mut CreatedResources,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        validate_config(DRIVER_NAME, config, CONFIG_FIELDS)
    }

    fn abilities(&self) -> DriverAbilities {
        DriverAbilities { send_signals: true }
    }

    fn fs_isolation(&self) -> FsIsolation {
        FsIsolation::None
    }
}

fn exit_result(status: std::process::ExitStatus) -> WaitResult {
    use std::os::unix::process::ExitStatusExt;
    WaitResult::new(status.code().unwrap_or(-1), status.signal().unwrap_or(0), None)
}

/// Whether `pid` still exists. EPERM means it exists but belongs to someone else.
fn is_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(errno) => errno != Errno::ESRCH,
    }
}

/// Start time of `pid` in clock ticks since boot, from `/proc/<pid>/stat`.
///
/// `None` where procfs is unavailable.
async fn process_start_ticks(pid: i32) -> Option<u64> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    parse_start_ticks(&stat)
}

/// Field 22 of a stat line. The command name (field 2) may contain spaces
/// and parentheses, so fields are counted from its closing paren.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// A reattached process is not our child, so its exit status is unknowable.
async fn poll_until_exit(pid: i32, notifier: ExitNotifier) {
    while is_alive(pid) {
        tokio::time::sleep(REATTACH_POLL_INTERVAL).await;
    }
    notifier.notify(WaitResult::new(
        0,
        0,
        Some("exit status unavailable for reattached process".to_string()),
    ));
}

struct RawExecHandle {
    pid: i32,
    started_at: i64,
    start_ticks: Option<u64>,
    kill_timeout: Mutex<Duration>,
    max_kill_timeout: Duration,
    waiter: ExitWaiter,
}

impl RawExecHandle {
    fn current_kill_timeout(&self) -> Duration {
        *self
            .kill_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send `sig`, treating an already-exited process as success.
    fn send(&self, sig: NixSignal) -> Result<(), DriverError> {
        match signal::kill(Pid::from_raw(self.pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(DriverError::Operation(format!(
                "failed to send {sig:?} to pid {}: {errno}",
                self.pid
            ))),
        }
    }
}

#[async_trait]
impl DriverHandle for RawExecHandle {
    fn id(&self) -> String {
        let id = RawExecHandleId {
            pid: self.pid,
            started_at: self.started_at,
            start_ticks: self.start_ticks,
        };
        serde_json::to_string(&id).unwrap_or_default()
    }

    fn wait_ch(&self) -> ExitWaiter {
        self.waiter.clone()
    }

    async fn update(&self, task: &Task) -> Result<(), DriverError> {
        let timeout = task.kill_timeout.min(self.max_kill_timeout);
        *self
            .kill_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
        Ok(())
    }

    async fn kill(&self) -> Result<(), DriverError> {
        if self.waiter.is_done() {
            return Ok(());
        }
        self.send(NixSignal::SIGINT)?;

        let grace = self.current_kill_timeout();
        if tokio::time::timeout(grace, self.waiter.clone().wait())
            .await
            .is_ok()
        {
            return Ok(());
        }

        tracing::warn!(pid = self.pid, ?grace, "raw_exec task ignored SIGINT, sending SIGKILL");
        self.send(NixSignal::SIGKILL)?;
        self.waiter.clone().wait().await;
        Ok(())
    }

    async fn stats(&self) -> Result<TaskResourceUsage, DriverError> {
        Err(DriverError::not_implemented(DRIVER_NAME, "stats"))
    }

    async fn signal(&self, signal: Signal) -> Result<(), DriverError> {
        if self.waiter.is_done() {
            return Err(DriverError::Operation(format!(
                "cannot send {signal}: process {} has exited",
                self.pid
            )));
        }
        self.send(signal.to_nix())
    }
}
