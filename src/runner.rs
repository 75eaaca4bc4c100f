//! Drives one task through its driver and persists what must survive a crash.
//!
//! The runner owns the task's resource ledger once `prepare` hands it over.
//! Every change to the ledger or the handle id is written to the state file
//! before the operation returns, so a restarted agent can reattach to the
//! task and reclaim exactly what was created.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::driver::{CreatedResources, Driver, DriverHandle, ExecContext, WaitResult};
use crate::error::{DriverError, Error, StateError};
use crate::task::Task;

/// Retry policy for recoverable cleanup failures.
#[derive(Debug, Clone)]
pub struct CleanupRetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CleanupRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Delay before cleanup retry `attempt` (0-based).
///
/// `base_delay * 2^attempt`, capped at `max_delay`, then moved by a uniform
/// jitter of up to 25% either way. Never shorter than 1ms.
fn backoff_delay(config: &CleanupRetryConfig, attempt: u32) -> Duration {
    let ceiling = config.max_delay.as_millis() as u64;
    let nominal = 2u64
        .checked_pow(attempt)
        .and_then(|factor| (config.base_delay.as_millis() as u64).checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(ceiling);

    let spread = (nominal / 4) as i64;
    let jitter = match spread {
        0 => 0,
        _ => rand::thread_rng().gen_range(-spread..=spread),
    };
    Duration::from_millis(nominal.saturating_add_signed(jitter).max(1))
}

/// Persisted state of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Id of the running task's handle, for reattaching.
    #[serde(default)]
    pub handle_id: Option<String>,
    /// Resources awaiting cleanup. `None` means there is nothing to clean up.
    #[serde(default)]
    pub created_resources: Option<CreatedResources>,
}

impl TaskState {
    /// Where the state of `task_name` in `alloc_id` lives under `state_dir`.
    pub fn path(state_dir: &Path, alloc_id: &str, task_name: &str) -> PathBuf {
        state_dir.join(alloc_id).join(format!("{task_name}.json"))
    }

    /// Load state from `path`. A missing file yields `None`.
    pub async fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StateError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Write state to `path` atomically via a temp file and rename.
    pub async fn persist(&self, path: &Path) -> Result<(), StateError> {
        let write_err = |e: &dyn std::fmt::Display| StateError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_err(&e))?;
        }
        let raw = serde_json::to_vec_pretty(self).map_err(|e| write_err(&e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| write_err(&e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| write_err(&e))?;
        Ok(())
    }
}

/// Runs one task through prepare, start (or restore), wait, kill, and cleanup.
pub struct TaskRunner {
    driver: Box<dyn Driver>,
    exec_ctx: ExecContext,
    task: Task,
    state_path: PathBuf,
    state: TaskState,
    handle: Option<Box<dyn DriverHandle>>,
    /// Set once `prepare` succeeds; `start` is refused until then.
    prepared: bool,
    retry: CleanupRetryConfig,
}

impl TaskRunner {
    /// Runner with fresh state stored under `state_dir`.
    pub fn new(driver: Box<dyn Driver>, exec_ctx: ExecContext, task: Task, state_dir: &Path) -> Self {
        let state_path = TaskState::path(state_dir, exec_ctx.alloc_id(), &task.name);
        Self {
            driver,
            exec_ctx,
            task,
            state_path,
            state: TaskState::default(),
            handle: None,
            prepared: false,
            retry: CleanupRetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: CleanupRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load previously persisted state, if any.
    pub async fn load_state(mut self) -> Result<Self, Error> {
        if let Some(state) = TaskState::load(&self.state_path).await? {
            self.state = state;
        }
        Ok(self)
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn handle(&self) -> Option<&dyn DriverHandle> {
        self.handle.as_deref()
    }

    async fn persist(&self) -> Result<(), StateError> {
        self.state.persist(&self.state_path).await
    }

    fn merge_resources(&mut self, created: Option<&CreatedResources>) {
        let Some(created) = created.filter(|created| !created.is_empty()) else {
            return;
        };
        self.state
            .created_resources
            .get_or_insert_with(CreatedResources::new)
            .merge(Some(created));
    }

    /// Validate the task config and prepare the task.
    ///
    /// Whatever the driver created, even on failure, is merged into the
    /// persisted ledger before this returns.
    pub async fn prepare(&mut self) -> Result<(), Error> {
        self.prepared = false;
        self.driver.validate(&self.task.config)?;

        match self.driver.prepare(&self.exec_ctx, &self.task).await {
            Ok(created) => {
                self.merge_resources(created.as_ref());
                self.persist().await?;
                self.prepared = true;
                tracing::debug!(task = %self.task.name, "Task prepared");
                Ok(())
            }
            Err(err) => {
                self.merge_resources(Some(&err.created));
                self.persist().await?;
                tracing::warn!(
                    task = %self.task.name,
                    alloc_id = %self.exec_ctx.alloc_id(),
                    recoverable = err.source.is_recoverable(),
                    "Prepare failed: {}",
                    err.source
                );
                Err(err.source.into())
            }
        }
    }

    /// Start the task. Fails unless `prepare` has succeeded on this runner.
    pub async fn start(&mut self) -> Result<(), Error> {
        if !self.prepared {
            return Err(StateError::NotPrepared(self.task.name.clone()).into());
        }
        let handle = self.driver.start(&self.exec_ctx, &self.task).await?;
        self.state.handle_id = Some(handle.id());
        self.persist().await?;
        tracing::info!(
            task = %self.task.name,
            alloc_id = %self.exec_ctx.alloc_id(),
            driver = %self.driver.name(),
            "Task started"
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Reattach to the task using the persisted handle id.
    ///
    /// If the task is gone the stale handle id is forgotten; the ledger is
    /// kept so cleanup still runs.
    pub async fn restore(&mut self) -> Result<(), Error> {
        let handle_id = self
            .state
            .handle_id
            .clone()
            .ok_or_else(|| StateError::NoHandle(self.task.name.clone()))?;

        match self.driver.open(&self.exec_ctx, &handle_id).await {
            Ok(handle) => {
                tracing::info!(task = %self.task.name, "Reattached to task");
                self.handle = Some(handle);
                Ok(())
            }
            Err(err @ DriverError::HandleNotFound(_)) => {
                self.state.handle_id = None;
                self.persist().await?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wait for the task to exit.
    pub async fn wait(&self) -> Result<WaitResult, Error> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| StateError::NoHandle(self.task.name.clone()))?;
        Ok(handle.wait_ch().wait().await)
    }

    /// Stop the task if it is running and forget its handle.
    pub async fn kill(&mut self) -> Result<(), Error> {
        if let Some(handle) = &self.handle {
            handle.kill().await?;
        }
        self.handle = None;
        self.state.handle_id = None;
        self.persist().await?;
        Ok(())
    }

    fn report_unreclaimed(&self, remaining: &CreatedResources) {
        for (kind, ids) in remaining.iter() {
            for id in ids {
                tracing::error!(
                    task = %self.task.name,
                    alloc_id = %self.exec_ctx.alloc_id(),
                    kind,
                    id = %id,
                    "Resource was not reclaimed and needs manual cleanup"
                );
            }
        }
    }

    /// Reclaim every resource in the persisted ledger.
    ///
    /// Recoverable failures are retried with backoff. The shrinking ledger is
    /// persisted after every attempt. On a fatal failure, or once retries are
    /// exhausted, the remaining entries are logged and kept in state. The same
    /// happens when the driver succeeds but leaves entries it does not own.
    pub async fn cleanup(&mut self) -> Result<(), Error> {
        let Some(persisted) = &self.state.created_resources else {
            return Ok(());
        };
        let mut remaining = persisted.clone();

        let mut attempt = 0;
        loop {
            let result = self.driver.cleanup(&self.exec_ctx, &mut remaining).await;
            match result {
                Ok(()) if remaining.is_empty() => {
                    self.state.created_resources = None;
                    self.persist().await?;
                    tracing::info!(task = %self.task.name, "Task resources reclaimed");
                    return Ok(());
                }
                Ok(()) => {
                    // The driver left entries it does not know how to reclaim.
                    self.state.created_resources = Some(remaining.clone());
                    self.persist().await?;
                    self.report_unreclaimed(&remaining);
                    let (kind, ids) = remaining
                        .iter()
                        .next()
                        .map(|(kind, ids)| (kind.to_string(), ids.join(",")))
                        .unwrap_or_default();
                    return Err(DriverError::Cleanup {
                        kind,
                        id: ids,
                        reason: format!("{} does not reclaim this resource", self.driver.name()),
                        recoverable: false,
                    }
                    .into());
                }
                Err(err) => {
                    self.state.created_resources = Some(remaining.clone());
                    self.persist().await?;

                    if err.is_recoverable() && attempt < self.retry.max_retries {
                        let delay = backoff_delay(&self.retry, attempt);
                        attempt += 1;
                        tracing::warn!(
                            task = %self.task.name,
                            attempt,
                            max_retries = self.retry.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Cleanup failed, retrying: {}",
                            err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.report_unreclaimed(&remaining);
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::allocdir::TaskDir;
    use crate::driver::DriverContext;
    use crate::driver::mock::{self, MockDriver};

    fn retry() -> CleanupRetryConfig {
        CleanupRetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = retry();
        for _ in 0..20 {
            let first = backoff_delay(&config, 0);
            assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
            let capped = backoff_delay(&config, 10);
            assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(500));
        }
    }

    #[test]
    fn backoff_never_hits_zero() {
        let config = CleanupRetryConfig {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(1));
        assert_eq!(backoff_delay(&config, 70), Duration::from_millis(1));
    }

    #[test]
    fn state_path_is_per_alloc_and_task() {
        assert_eq!(
            TaskState::path(Path::new("/state"), "a1", "web"),
            PathBuf::from("/state/a1/web.json")
        );
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = TaskState::path(dir.path(), "a1", "web");
        assert_eq!(TaskState::load(&path).await.unwrap(), None);

        let state = TaskState {
            handle_id: Some("{\"pid\":42}".into()),
            created_resources: Some([("image", "img1")].into_iter().collect()),
        };
        state.persist(&path).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(TaskState::load(&path).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn corrupt_state_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            TaskState::load(&path).await,
            Err(StateError::Read { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn unreclaimed_resources_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let exec_ctx = ExecContext::new(TaskDir::new(&dir.path().join("alloc"), "web"), "a1");
        let task = Task::new("web", mock::DRIVER_NAME)
            .with_config("prepare_resources", serde_json::json!({"image": ["img1"]}))
            .with_config("cleanup_fail_on", serde_json::json!("img1"))
            .with_config("cleanup_fail_num", serde_json::json!(10));
        let mut runner = TaskRunner::new(
            Box::new(MockDriver::new(DriverContext::empty())),
            exec_ctx,
            task,
            &dir.path().join("state"),
        )
        .with_retry_config(CleanupRetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        });

        runner.prepare().await.unwrap();
        assert!(runner.cleanup().await.is_err());
        assert!(logs_contain("Cleanup failed, retrying"));
        assert!(logs_contain("needs manual cleanup"));
        assert!(logs_contain("img1"));
    }

    #[test]
    fn missing_ledger_serializes_as_null() {
        let json = serde_json::to_value(TaskState::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"handle_id": null, "created_resources": null})
        );
    }
}
