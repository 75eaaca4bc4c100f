//! Deterministic driver for exercising the lifecycle in tests.
//!
//! Behaviour is driven entirely by task config:
//!
//! | key                       | effect                                              |
//! |---------------------------|-----------------------------------------------------|
//! | `run_for_ms`              | how long the fake task runs                         |
//! | `exit_code`               | exit code reported on completion                    |
//! | `exit_signal`             | signal number reported on completion                |
//! | `exit_err_msg`            | error reported on completion                        |
//! | `start_error`             | fail `start` with this message                      |
//! | `start_error_recoverable` | whether the start error is recoverable              |
//! | `prepare_resources`       | `{kind: [id, ...]}` recorded by `prepare`           |
//! | `prepare_error`           | fail `prepare` after recording resources            |
//! | `cleanup_fail_num`        | times cleanup of `cleanup_fail_on` fails first      |
//! | `cleanup_fail_on`         | resource id whose cleanup fails (recoverably)       |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::Instrument;

use super::config::{ConfigField, FieldKind, decode_config, validate_config};
use super::{
    CreatedResources, Driver, DriverAbilities, DriverContext, DriverHandle, ExecContext, ExitNotifier,
    ExitWaiter, FsIsolation, Signal, TaskResourceUsage, WaitResult, exit_channel,
};
use crate::config::AgentConfig;
use crate::error::{DriverError, PrepareError};
use crate::fingerprint::Fingerprint;
use crate::node::Node;
use crate::task::Task;

pub const DRIVER_NAME: &str = "mock_driver";

/// Signal number reported when a mock task is killed.
const KILL_SIGNAL: i32 = 9;

const CONFIG_FIELDS: &[ConfigField] = &[
    ConfigField::optional("run_for_ms", FieldKind::Integer),
    ConfigField::optional("exit_code", FieldKind::Integer),
    ConfigField::optional("exit_signal", FieldKind::Integer),
    ConfigField::optional("exit_err_msg", FieldKind::String),
    ConfigField::optional("start_error", FieldKind::String),
    ConfigField::optional("start_error_recoverable", FieldKind::Bool),
    ConfigField::optional("prepare_resources", FieldKind::StringListMap),
    ConfigField::optional("prepare_error", FieldKind::String),
    ConfigField::optional("cleanup_fail_num", FieldKind::Integer),
    ConfigField::optional("cleanup_fail_on", FieldKind::String),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MockTaskConfig {
    run_for_ms: u64,
    exit_code: i32,
    exit_signal: i32,
    exit_err_msg: Option<String>,
    start_error: Option<String>,
    start_error_recoverable: bool,
    prepare_resources: HashMap<String, Vec<String>>,
    prepare_error: Option<String>,
    cleanup_fail_num: u32,
    cleanup_fail_on: Option<String>,
}

#[derive(Debug, Default)]
struct CleanupState {
    fail_on: Option<String>,
    fail_num: u32,
    failures: u32,
    reclaimed: Vec<(String, String)>,
}

/// Test driver whose behaviour is scripted by task config.
pub struct MockDriver {
    ctx: DriverContext,
    isolation: FsIsolation,
    abilities: DriverAbilities,
    cleanup: Arc<Mutex<CleanupState>>,
}

impl MockDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            isolation: FsIsolation::None,
            abilities: DriverAbilities { send_signals: true },
            cleanup: Arc::new(Mutex::new(CleanupState::default())),
        }
    }

    /// Report a different isolation mode, e.g. to test environment building.
    pub fn with_fs_isolation(mut self, isolation: FsIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Declare different abilities. Handles honour them.
    pub fn with_abilities(mut self, abilities: DriverAbilities) -> Self {
        self.abilities = abilities;
        self
    }

    /// Every `(kind, id)` cleanup has reclaimed, in order.
    pub fn reclaimed(&self) -> Vec<(String, String)> {
        self.lock_cleanup().reclaimed.clone()
    }

    /// A handle onto the reclaim log that outlives the driver's box.
    pub fn reclaim_log(&self) -> ReclaimLog {
        ReclaimLog {
            state: Arc::clone(&self.cleanup),
        }
    }

    fn lock_cleanup(&self) -> std::sync::MutexGuard<'_, CleanupState> {
        self.cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task_config(&self, task: &Task) -> Result<MockTaskConfig, DriverError> {
        decode_config(DRIVER_NAME, &task.config, CONFIG_FIELDS)
    }

    fn launch(&self, state: MockHandleState) -> MockHandle {
        let (notifier, waiter) = exit_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let remaining = state.remaining();
        let result = state.exit_result();
        tokio::spawn(
            run_fake_task(remaining, result, kill_rx, notifier).instrument(self.ctx.span().clone()),
        );
        MockHandle {
            state,
            abilities: self.abilities,
            waiter,
            kill_tx: Mutex::new(Some(kill_tx)),
        }
    }
}

/// Shared view of what a [`MockDriver`] has reclaimed.
#[derive(Debug, Clone)]
pub struct ReclaimLog {
    state: Arc<Mutex<CleanupState>>,
}

impl ReclaimLog {
    pub fn entries(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reclaimed
            .clone()
    }
}

async fn run_fake_task(
    run_for: Duration,
    result: WaitResult,
    kill_rx: oneshot::Receiver<()>,
    notifier: ExitNotifier,
) {
    tokio::select! {
        _ = tokio::time::sleep(run_for) => notifier.notify(result),
        // A dropped sender also ends the task, mirroring a reaped process.
        _ = kill_rx => notifier.notify(WaitResult::new(0, KILL_SIGNAL, None)),
    }
}

#[async_trait]
impl Fingerprint for MockDriver {
    async fn fingerprint(
        &self,
        _config: &AgentConfig,
        node: &mut Node,
    ) -> Result<bool, DriverError> {
        node.attributes
            .insert(format!("driver.{DRIVER_NAME}"), "1".to_string());
        Ok(true)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn prepare(
        &self,
        _ctx: &ExecContext,
        task: &Task,
    ) -> Result<Option<CreatedResources>, PrepareError> {
        let config = self.task_config(task)?;
        {
            let mut cleanup = self.lock_cleanup();
            cleanup.fail_on = config.cleanup_fail_on.clone();
            cleanup.fail_num = config.cleanup_fail_num;
            cleanup.failures = 0;
        }

        let mut kinds: Vec<_> = config.prepare_resources.iter().collect();
        kinds.sort_by(|a, b| a.0.cmp(b.0));
        let mut created = CreatedResources::new();
        for (kind, ids) in kinds {
            for id in ids {
                created.add(kind.as_str(), id.as_str());
            }
        }

        if let Some(reason) = config.prepare_error {
            return Err(PrepareError::new(
                created,
                DriverError::Prepare {
                    reason,
                    recoverable: true,
                },
            ));
        }
        Ok((!created.is_empty()).then_some(created))
    }

    async fn start(
        &self,
        _ctx: &ExecContext,
        task: &Task,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let config = self.task_config(task)?;
        if let Some(reason) = config.start_error {
            return Err(DriverError::Start {
                reason,
                recoverable: config.start_error_recoverable,
            });
        }

        let state = MockHandleState {
            task_name: task.name.clone(),
            run_for_ms: config.run_for_ms,
            exit_code: config.exit_code,
            exit_signal: config.exit_signal,
            exit_err_msg: config.exit_err_msg,
            started_at_ms: Utc::now().timestamp_millis(),
        };
        tracing::debug!(task = %task.name, run_for_ms = state.run_for_ms, "Starting mock task");
        Ok(Box::new(self.launch(state)))
    }

    async fn open(
        &self,
        _ctx: &ExecContext,
        handle_id: &str,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let state: MockHandleState =
            serde_json::from_str(handle_id).map_err(|e| DriverError::InvalidHandle {
                id: handle_id.to_string(),
                reason: e.to_string(),
            })?;
        if state.remaining().is_zero() {
            return Err(DriverError::HandleNotFound(handle_id.to_string()));
        }
        Ok(Box::new(self.launch(state)))
    }

    async fn cleanup(
        &self,
        _ctx: &ExecContext,
        resources: &mut CreatedResources,
    ) -> Result<(), DriverError> {
        let entries: Vec<(String, String)> = resources
            .iter()
            .flat_map(|(kind, ids)| ids.iter().map(move |id| (kind.to_string(), id.clone())))
            .collect();

        for (kind, id) in entries {
            let mut state = self.lock_cleanup();
            if state.fail_on.as_deref() == Some(id.as_str()) && state.failures < state.fail_num {
                state.failures += 1;
                return Err(DriverError::Cleanup {
                    kind,
                    id,
                    reason: format!("simulated failure {} of {}", state.failures, state.fail_num),
                    recoverable: true,
                });
            }
            if !state.reclaimed.iter().any(|(k, i)| *k == kind && *i == id) {
                state.reclaimed.push((kind.clone(), id.clone()));
            }
            resources.remove(&kind, &id);
        }
        Ok(())
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        validate_config(DRIVER_NAME, config, CONFIG_FIELDS)
    }

    fn abilities(&self) -> DriverAbilities {
        self.abilities
    }

    fn fs_isolation(&self) -> FsIsolation {
        self.isolation
    }
}

/// Everything needed to recreate a mock task; serialized as the handle id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockHandleState {
    task_name: String,
    run_for_ms: u64,
    exit_code: i32,
    exit_signal: i32,
    exit_err_msg: Option<String>,
    started_at_ms: i64,
}

impl MockHandleState {
    fn remaining(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.started_at_ms;
        let elapsed = u64::try_from(elapsed).unwrap_or(0);
        Duration::from_millis(self.run_for_ms.saturating_sub(elapsed))
    }

    fn exit_result(&self) -> WaitResult {
        WaitResult::new(self.exit_code, self.exit_signal, self.exit_err_msg.clone())
    }
}

struct MockHandle {
    state: MockHandleState,
    abilities: DriverAbilities,
    waiter: ExitWaiter,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl DriverHandle for MockHandle {
    fn id(&self) -> String {
        serde_json::to_string(&self.state).unwrap_or_default()
    }

    fn wait_ch(&self) -> ExitWaiter {
        self.waiter.clone()
    }

    async fn update(&self, _task: &Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn kill(&self) -> Result<(), DriverError> {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = kill_tx {
            // Err means the task already finished.
            let _ = tx.send(());
        }
        self.waiter.clone().wait().await;
        Ok(())
    }

    async fn stats(&self) -> Result<TaskResourceUsage, DriverError> {
        Ok(TaskResourceUsage {
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            ..TaskResourceUsage::default()
        })
    }

    async fn signal(&self, signal: Signal) -> Result<(), DriverError> {
        if !self.abilities.send_signals {
            return Err(DriverError::not_implemented(DRIVER_NAME, "signal"));
        }
        tracing::debug!(task = %self.state.task_name, %signal, "Mock task signalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::allocdir::TaskDir;

    fn exec_ctx() -> ExecContext {
        ExecContext::new(TaskDir::new(Path::new("/tmp/alloc"), "web"), "alloc-1")
    }

    fn task(config: Value) -> Task {
        let mut task = Task::new("web", DRIVER_NAME);
        task.config = config.as_object().cloned().unwrap();
        task
    }

    #[tokio::test]
    async fn signal_without_ability_is_not_implemented() {
        let driver = MockDriver::new(DriverContext::empty())
            .with_abilities(DriverAbilities { send_signals: false });
        assert!(!driver.abilities().send_signals);

        let handle = driver
            .start(&exec_ctx(), &task(json!({"run_for_ms": 50})))
            .await
            .unwrap();
        let err = handle.signal(Signal::Term).await.unwrap_err();
        assert!(err.is_not_implemented());
        assert!(err.to_string().contains("signal"));

        // Lacking the ability never blocks termination.
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn runs_and_reports_exit() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({"run_for_ms": 10, "exit_code": 3}));
        let handle = driver.start(&exec_ctx(), &task).await.unwrap();
        let result = handle.wait_ch().wait().await;
        assert_eq!(result.exit_code, 3);
        // Killing a finished task is fine.
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_stops_long_running_task() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({"run_for_ms": 60_000}));
        let handle = driver.start(&exec_ctx(), &task).await.unwrap();
        handle.kill().await.unwrap();
        let result = handle.wait_ch().try_result().unwrap();
        assert_eq!(result.signal, KILL_SIGNAL);
    }

    #[tokio::test]
    async fn start_error_carries_recoverability() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({"start_error": "boom", "start_error_recoverable": true}));
        let err = driver.start(&exec_ctx(), &task).await.err().unwrap();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn prepare_error_returns_partial_ledger() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({
            "prepare_resources": {"image": ["img1"]},
            "prepare_error": "device allocation failed"
        }));
        let err = driver.prepare(&exec_ctx(), &task).await.unwrap_err();
        assert!(err.created.contains("image", "img1"));
    }

    #[tokio::test]
    async fn prepare_without_resources_returns_none() {
        let driver = MockDriver::new(DriverContext::empty());
        let created = driver.prepare(&exec_ctx(), &task(json!({}))).await.unwrap();
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn cleanup_fails_then_succeeds() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({
            "prepare_resources": {"image": ["img1", "img2"]},
            "cleanup_fail_on": "img2",
            "cleanup_fail_num": 1
        }));
        let mut ledger = driver.prepare(&exec_ctx(), &task).await.unwrap().unwrap();

        let err = driver.cleanup(&exec_ctx(), &mut ledger).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(!ledger.contains("image", "img1"));
        assert!(ledger.contains("image", "img2"));

        driver.cleanup(&exec_ctx(), &mut ledger).await.unwrap();
        assert!(ledger.is_empty());
        assert_eq!(
            driver.reclaimed(),
            vec![
                ("image".to_string(), "img1".to_string()),
                ("image".to_string(), "img2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn open_reattaches_until_run_time_elapses() {
        let driver = MockDriver::new(DriverContext::empty());
        let task = task(json!({"run_for_ms": 60_000, "exit_code": 1}));
        let handle = driver.start(&exec_ctx(), &task).await.unwrap();

        let reopened = driver.open(&exec_ctx(), &handle.id()).await.unwrap();
        reopened.kill().await.unwrap();
        handle.kill().await.unwrap();

        let finished = task_state_json(0);
        let err = driver.open(&exec_ctx(), &finished).await.err().unwrap();
        assert!(matches!(err, DriverError::HandleNotFound(_)));

        let err = driver.open(&exec_ctx(), "not json").await.err().unwrap();
        assert!(matches!(err, DriverError::InvalidHandle { .. }));
    }

    fn task_state_json(run_for_ms: u64) -> String {
        serde_json::to_string(&MockHandleState {
            task_name: "web".into(),
            run_for_ms,
            exit_code: 0,
            exit_signal: 0,
            exit_err_msg: None,
            started_at_ms: 0,
        })
        .unwrap()
    }

    #[test]
    fn validate_rejects_unknown_and_mistyped_fields() {
        let driver = MockDriver::new(DriverContext::empty());
        let bad = json!({"run_for": 10}).as_object().cloned().unwrap();
        assert!(driver.validate(&bad).is_err());

        let bad = json!({"run_for_ms": "ten"}).as_object().cloned().unwrap();
        assert!(driver.validate(&bad).is_err());

        let ok = json!({"run_for_ms": 10, "cleanup_fail_on": "img1"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(driver.validate(&ok).is_ok());
    }
}
