//! Runs a task inside a Docker container, talking to the daemon via `bollard`.
//!
//! Images pulled during `prepare` are recorded in the task's resource ledger
//! (when `docker.cleanup.image` is enabled) and removed again by `cleanup`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
    UpdateContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;

use super::config::{ConfigField, FieldKind, decode_config, validate_config};
use super::{
    CpuStats, CreatedResources, Driver, DriverAbilities, DriverContext, DriverHandle,
    ExecContext, ExitNotifier, ExitWaiter, FsIsolation, MemoryStats, ResourceUsage, Signal,
    TaskResourceUsage, WaitResult, exit_channel,
};
use crate::allocdir::{
    SHARED_ALLOC_CONTAINER_PATH, TASK_LOCAL_CONTAINER_PATH, TASK_SECRETS_CONTAINER_PATH,
};
use crate::config::AgentConfig;
use crate::error::{DriverError, PrepareError};
use crate::fingerprint::Fingerprint;
use crate::node::Node;
use crate::task::Task;

pub const DRIVER_NAME: &str = "docker";

/// Ledger kind for pulled images.
pub const IMAGE_RESOURCE: &str = "image";

/// Whether pulled images are recorded for removal during cleanup.
pub const CLEANUP_IMAGE_OPTION: &str = "docker.cleanup.image";

const FINGERPRINT_PERIOD: Duration = Duration::from_secs(30);

/// Docker rejects CPU share values below this.
const MIN_CPU_SHARES: i64 = 2;

const CONFIG_FIELDS: &[ConfigField] = &[
    ConfigField::required("image", FieldKind::String),
    ConfigField::optional("command", FieldKind::String),
    ConfigField::optional("args", FieldKind::StringList),
    ConfigField::optional("force_pull", FieldKind::Bool),
    ConfigField::optional("labels", FieldKind::StringMap),
];

#[derive(Debug, Deserialize)]
struct DockerTaskConfig {
    image: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    force_pull: bool,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// Serialized form of a docker handle id.
#[derive(Debug, Serialize, Deserialize)]
struct DockerHandleId {
    container_id: String,
    image: String,
}

/// Connect to the local daemon and confirm it answers a ping.
async fn connect_docker() -> Result<Docker, DriverError> {
    ready(Docker::connect_with_local_defaults()?).await
}

async fn ready(docker: Docker) -> Result<Docker, DriverError> {
    docker.ping().await?;
    Ok(docker)
}

/// A daemon that is down may come back, so preparing again is worthwhile.
fn daemon_unavailable(err: DriverError) -> DriverError {
    match err {
        DriverError::Docker(e) => DriverError::Prepare {
            reason: format!("docker daemon unavailable: {e}"),
            recoverable: true,
        },
        other => other,
    }
}

/// Force-remove a container, logging anything but "already gone".
async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_id, Some(options)).await
        && !is_status(&e, 404)
    {
        tracing::warn!(container_id = %container_id, "Failed to remove container: {}", e);
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

pub struct DockerDriver {
    ctx: DriverContext,
}

impl DockerDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    fn cleanup_images(&self) -> bool {
        self.ctx
            .config()
            .read_bool_default(CLEANUP_IMAGE_OPTION, true)
            .unwrap_or(true)
    }

    /// Pull `image` unless it is present. Returns whether a pull happened.
    async fn ensure_image(
        &self,
        docker: &Docker,
        image: &str,
        force_pull: bool,
    ) -> Result<bool, DriverError> {
        if !force_pull && docker.inspect_image(image).await.is_ok() {
            tracing::debug!(%image, "Image already present");
            return Ok(false);
        }

        self.ctx.emit_event(format!("Downloading image {image}"));
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = std::pin::pin!(docker.create_image(Some(options), None, None));
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| DriverError::Prepare {
                reason: format!("failed to pull image {image}: {e}"),
                recoverable: true,
            })?;
        }
        tracing::info!(%image, "Pulled image");
        Ok(true)
    }

    fn watch(&self, docker: Docker, container_id: String, notifier: ExitNotifier) {
        tokio::spawn(
            async move {
                let result = wait_for_exit(&docker, &container_id).await;
                tracing::debug!(container_id = %container_id, %result, "Container exited");
                remove_container(&docker, &container_id).await;
                notifier.notify(result);
            }
            .instrument(self.ctx.span().clone()),
        );
    }

    fn container_config(&self, ctx: &ExecContext, task: &Task, config: &DockerTaskConfig) -> Config<String> {
        let task_dir = ctx.task_dir();
        let binds = vec![
            format!("{}:{SHARED_ALLOC_CONTAINER_PATH}", task_dir.shared_alloc_dir.display()),
            format!("{}:{TASK_LOCAL_CONTAINER_PATH}", task_dir.local_dir.display()),
            format!("{}:{TASK_SECRETS_CONTAINER_PATH}", task_dir.secrets_dir.display()),
        ];

        let (memory, cpu_shares) = limits(task);
        let env = self.ctx.task_env();
        let cmd = config.command.as_ref().map(|command| {
            let mut cmd = vec![command.clone()];
            cmd.extend(config.args.iter().cloned());
            match env {
                Some(env) => env.parse_and_replace(&cmd),
                None => cmd,
            }
        });

        Config {
            image: Some(config.image.clone()),
            cmd,
            env: env.map(|env| env.list()),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            user: task.user.clone(),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory,
                cpu_shares,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Memory (bytes) and CPU shares for the task's declared resources.
fn limits(task: &Task) -> (Option<i64>, Option<i64>) {
    match &task.resources {
        Some(resources) => (
            Some(i64::from(resources.memory_mb) * 1024 * 1024),
            Some(i64::from(resources.cpu).max(MIN_CPU_SHARES)),
        ),
        None => (None, None),
    }
}

async fn wait_for_exit(docker: &Docker, container_id: &str) -> WaitResult {
    let mut wait =
        std::pin::pin!(docker.wait_container(container_id, None::<WaitContainerOptions<String>>));
    match wait.next().await {
        Some(Ok(response)) => WaitResult::new(
            i32::try_from(response.status_code).unwrap_or(-1),
            0,
            response.error.and_then(|e| e.message),
        ),
        // Non-zero exits surface as an error from the wait endpoint.
        Some(Err(BollardError::DockerContainerWaitError { code, error })) => WaitResult::new(
            i32::try_from(code).unwrap_or(-1),
            0,
            (!error.is_empty()).then_some(error),
        ),
        Some(Err(e)) => WaitResult::new(-1, 0, Some(e.to_string())),
        None => WaitResult::new(-1, 0, Some("container wait stream ended".to_string())),
    }
}

#[async_trait]
impl Fingerprint for DockerDriver {
    async fn fingerprint(&self, _config: &AgentConfig, node: &mut Node) -> Result<bool, DriverError> {
        let attribute = format!("driver.{DRIVER_NAME}");
        let version_attribute = format!("driver.{DRIVER_NAME}.version");

        let docker = match connect_docker().await {
            Ok(docker) => docker,
            Err(e) => {
                tracing::debug!("Docker daemon unavailable: {}", e);
                node.attributes.remove(&attribute);
                node.attributes.remove(&version_attribute);
                return Ok(false);
            }
        };

        node.attributes.insert(attribute, "1".to_string());
        match docker.version().await {
            Ok(version) => {
                if let Some(v) = version.version {
                    node.attributes.insert(version_attribute, v);
                }
            }
            Err(e) => tracing::debug!("Failed to read Docker version: {}", e),
        }
        Ok(true)
    }

    fn periodic(&self) -> Option<Duration> {
        Some(FINGERPRINT_PERIOD)
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn prepare(
        &self,
        _ctx: &ExecContext,
        task: &Task,
    ) -> Result<Option<CreatedResources>, PrepareError> {
        let config: DockerTaskConfig = decode_config(DRIVER_NAME, &task.config, CONFIG_FIELDS)?;
        let docker = connect_docker().await.map_err(daemon_unavailable)?;

        let pulled = self
            .ensure_image(&docker, &config.image, config.force_pull)
            .await?;
        if !(pulled && self.cleanup_images()) {
            return Ok(None);
        }

        let mut created = CreatedResources::new();
        created.add(IMAGE_RESOURCE, config.image);
        Ok(Some(created))
    }

    async fn start(
        &self,
        ctx: &ExecContext,
        task: &Task,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let config: DockerTaskConfig = decode_config(DRIVER_NAME, &task.config, CONFIG_FIELDS)?;
        let docker = connect_docker().await?;

        let name = format!("{}-{}", task.name, ctx.alloc_id());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = docker
            .create_container(Some(options), self.container_config(ctx, task, &config))
            .await
            .map_err(|e| DriverError::Start {
                reason: format!("failed to create container {name}: {e}"),
                recoverable: is_status(&e, 500),
            })?;

        if let Err(e) = docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&docker, &created.id).await;
            return Err(DriverError::Start {
                reason: format!("failed to start container {name}: {e}"),
                recoverable: false,
            });
        }

        tracing::info!(
            task = %task.name,
            alloc_id = %ctx.alloc_id(),
            container_id = %created.id,
            image = %config.image,
            "Started container"
        );

        let (notifier, waiter) = exit_channel();
        self.watch(docker.clone(), created.id.clone(), notifier);

        Ok(Box::new(DockerHandle {
            docker,
            container_id: created.id,
            image: config.image,
            kill_timeout: task.kill_timeout.min(self.ctx.config().max_kill_timeout),
            waiter,
        }))
    }

    async fn open(
        &self,
        _ctx: &ExecContext,
        handle_id: &str,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let id: DockerHandleId =
            serde_json::from_str(handle_id).map_err(|e| DriverError::InvalidHandle {
                id: handle_id.to_string(),
                reason: e.to_string(),
            })?;
        let docker = connect_docker().await?;

        let inspect = match docker
            .inspect_container(&id.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_status(&e, 404) => {
                return Err(DriverError::HandleNotFound(handle_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let running = inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(DriverError::HandleNotFound(handle_id.to_string()));
        }

        let (notifier, waiter) = exit_channel();
        self.watch(docker.clone(), id.container_id.clone(), notifier);
        tracing::info!(container_id = %id.container_id, "Reattached to container");

        Ok(Box::new(DockerHandle {
            docker,
            container_id: id.container_id,
            image: id.image,
            kill_timeout: crate::task::DEFAULT_KILL_TIMEOUT.min(self.ctx.config().max_kill_timeout),
            waiter,
        }))
    }

    async fn cleanup(
        &self,
        _ctx: &ExecContext,
        resources: &mut CreatedResources,
    ) -> Result<(), DriverError> {
        let Some(images) = resources.get(IMAGE_RESOURCE).map(<[String]>::to_vec) else {
            return Ok(());
        };
        let docker = Docker::connect_with_local_defaults()?;

        for image in images {
            let options = RemoveImageOptions {
                force: false,
                noprune: false,
            };
            match docker.remove_image(&image, Some(options), None).await {
                Ok(_) => tracing::info!(%image, "Removed image"),
                Err(e) if is_status(&e, 404) => {
                    tracing::debug!(%image, "Image already removed");
                }
                Err(e) => {
                    return Err(DriverError::Cleanup {
                        kind: IMAGE_RESOURCE.to_string(),
                        reason: e.to_string(),
                        recoverable: is_status(&e, 409) || is_status(&e, 500),
                        id: image,
                    });
                }
            }
            resources.remove(IMAGE_RESOURCE, &image);
        }
        Ok(())
    }

    fn validate(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        validate_config(DRIVER_NAME, config, CONFIG_FIELDS)
    }

    fn abilities(&self) -> DriverAbilities {
        DriverAbilities { send_signals: true }
    }

    fn fs_isolation(&self) -> FsIsolation {
        FsIsolation::Image
    }
}

struct DockerHandle {
    docker: Docker,
    container_id: String,
    image: String,
    kill_timeout: Duration,
    waiter: ExitWaiter,
}

#[async_trait]
impl DriverHandle for DockerHandle {
    fn id(&self) -> String {
        let id = DockerHandleId {
            container_id: self.container_id.clone(),
            image: self.image.clone(),
        };
        serde_json::to_string(&id).unwrap_or_default()
    }

    fn wait_ch(&self) -> ExitWaiter {
        self.waiter.clone()
    }

    async fn update(&self, task: &Task) -> Result<(), DriverError> {
        let (memory, cpu_shares) = limits(task);
        if memory.is_none() && cpu_shares.is_none() {
            return Ok(());
        }
        let options = UpdateContainerOptions::<String> {
            memory,
            cpu_shares: cpu_shares.and_then(|shares| isize::try_from(shares).ok()),
            ..Default::default()
        };
        self.docker
            .update_container(&self.container_id, options)
            .await
            .map_err(|e| DriverError::Operation(format!("failed to update container: {e}")))
    }

    async fn kill(&self) -> Result<(), DriverError> {
        if self.waiter.is_done() {
            return Ok(());
        }
        let options = StopContainerOptions {
            t: i64::try_from(self.kill_timeout.as_secs()).unwrap_or(i64::MAX),
        };
        match self
            .docker
            .stop_container(&self.container_id, Some(options))
            .await
        {
            // 304: already stopped. 404: already removed.
            Ok(()) => {}
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => {}
            Err(e) => return Err(e.into()),
        }
        self.waiter.clone().wait().await;
        Ok(())
    }

    async fn stats(&self) -> Result<TaskResourceUsage, DriverError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = std::pin::pin!(self.docker.stats(&self.container_id, Some(options)));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| DriverError::Operation("no stats returned".to_string()))??;
        Ok(usage_from_stats(&stats))
    }

    async fn signal(&self, signal: Signal) -> Result<(), DriverError> {
        let options = KillContainerOptions {
            signal: signal.as_str(),
        };
        self.docker
            .kill_container(&self.container_id, Some(options))
            .await
            .map_err(|e| DriverError::Operation(format!("failed to send {signal}: {e}")))
    }
}

fn usage_from_stats(stats: &Stats) -> TaskResourceUsage {
    let memory = &stats.memory_stats;
    let cpu = &stats.cpu_stats;

    let memory_stats = MemoryStats {
        rss: memory.usage.unwrap_or_default(),
        max_usage: memory.max_usage.unwrap_or_default(),
        measured: vec!["RSS".to_string(), "Max Usage".to_string()],
        ..MemoryStats::default()
    };
    let cpu_stats = CpuStats {
        system_mode: cpu.cpu_usage.usage_in_kernelmode as f64,
        user_mode: cpu.cpu_usage.usage_in_usermode as f64,
        total_ticks: cpu.cpu_usage.total_usage as f64,
        throttled_periods: cpu.throttling_data.throttled_periods,
        throttled_time: cpu.throttling_data.throttled_time,
        measured: vec![
            "System Mode".to_string(),
            "User Mode".to_string(),
            "Throttled Periods".to_string(),
            "Throttled Time".to_string(),
        ],
        ..CpuStats::default()
    };

    TaskResourceUsage {
        resource_usage: ResourceUsage {
            memory_stats,
            cpu_stats,
        },
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        pids: HashMap::new(),
    }
}
