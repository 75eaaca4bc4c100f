//! Per-task environment: variables and directory paths a task sees.
//!
//! The view depends on the driver's [`FsIsolation`]: drivers without
//! isolation see host paths, isolated drivers see fixed in-sandbox paths,
//! and fully image-isolated drivers receive no host variables.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};

use crate::allocdir::{
    SHARED_ALLOC_CONTAINER_PATH, TASK_LOCAL_CONTAINER_PATH, TASK_SECRETS_CONTAINER_PATH, TaskDir,
};
use crate::config::AgentConfig;
use crate::driver::{BUILTIN_DRIVERS, DriverContext, DriverRegistry, FsIsolation};
use crate::error::DriverError;
use crate::node::Node;
use crate::task::{Allocation, Resources, Task};

pub const ALLOC_DIR: &str = "TASK_ALLOC_DIR";
pub const TASK_LOCAL_DIR: &str = "TASK_LOCAL_DIR";
pub const TASK_SECRETS_DIR: &str = "TASK_SECRETS_DIR";
pub const MEMORY_LIMIT: &str = "TASK_MEMORY_LIMIT";
pub const CPU_LIMIT: &str = "TASK_CPU_LIMIT";
pub const ALLOC_ID: &str = "TASK_ALLOC_ID";
pub const ALLOC_NAME: &str = "TASK_ALLOC_NAME";
pub const ALLOC_INDEX: &str = "TASK_ALLOC_INDEX";
pub const TASK_NAME: &str = "TASK_NAME";
pub const JOB_NAME: &str = "TASK_JOB_NAME";
pub const GROUP_NAME: &str = "TASK_GROUP_NAME";
pub const DATACENTER: &str = "TASK_DC";
pub const VAULT_TOKEN: &str = "VAULT_TOKEN";

pub const META_PREFIX: &str = "TASK_META_";
pub const IP_PREFIX: &str = "TASK_IP_";
pub const PORT_PREFIX: &str = "TASK_PORT_";
pub const HOST_PORT_PREFIX: &str = "TASK_HOST_PORT_";
pub const ADDR_PREFIX: &str = "TASK_ADDR_";

const NODE_ID_KEY: &str = "node.unique.id";
const NODE_NAME_KEY: &str = "node.unique.name";
const NODE_DC_KEY: &str = "node.datacenter";
const NODE_CLASS_KEY: &str = "node.class";
const NODE_ATTR_PREFIX: &str = "attr.";
const NODE_META_PREFIX: &str = "meta.";

static INTERPOLATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^{}]+)\}").expect("valid interpolation pattern"));

/// Compute the environment for `task` using the builtin driver registry.
pub fn get_task_env(
    task_dir: &TaskDir,
    node: &Node,
    task: &Task,
    alloc: Option<&Allocation>,
    config: &AgentConfig,
    vault_token: Option<SecretString>,
) -> Result<TaskEnvironment, DriverError> {
    build_task_env(
        &BUILTIN_DRIVERS,
        task_dir,
        node,
        task,
        alloc,
        config,
        vault_token,
    )
}

pub(crate) fn build_task_env(
    registry: &DriverRegistry,
    task_dir: &TaskDir,
    node: &Node,
    task: &Task,
    alloc: Option<&Allocation>,
    config: &AgentConfig,
    vault_token: Option<SecretString>,
) -> Result<TaskEnvironment, DriverError> {
    let meta = match alloc {
        Some(alloc) => alloc.job.combined_task_meta(&alloc.task_group, &task.name),
        None => task.meta.clone(),
    };

    let mut builder = TaskEnvBuilder::new(node)
        .with_task_meta(meta)
        .with_task_name(&task.name)
        .with_env_vars(task.env.clone());

    // Only the driver's static descriptors are needed here.
    let driver = registry.new_driver(&task.driver, DriverContext::empty())?;
    let isolation = driver.fs_isolation();
    builder = match isolation {
        FsIsolation::None => builder.with_dirs(
            &task_dir.shared_alloc_dir,
            &task_dir.local_dir,
            &task_dir.secrets_dir,
        ),
        FsIsolation::Process | FsIsolation::Image => builder.with_dirs(
            Path::new(SHARED_ALLOC_CONTAINER_PATH),
            Path::new(TASK_LOCAL_CONTAINER_PATH),
            Path::new(TASK_SECRETS_CONTAINER_PATH),
        ),
    };

    if let Some(resources) = &task.resources {
        builder = builder.with_resources(resources);
    }
    if let Some(alloc) = alloc {
        builder = builder.with_alloc(alloc);
    }
    if let (Some(vault), Some(token)) = (&task.vault, vault_token) {
        builder = builder.with_vault_token(token, vault.env);
    }
    if isolation != FsIsolation::Image {
        builder = builder.with_host_env(unicode_vars(std::env::vars_os()), &config.env_denylist());
    }

    tracing::debug!(
        task = %task.name,
        driver = %task.driver,
        isolation = %isolation,
        "Computed task environment"
    );
    Ok(builder.build())
}

/// Host variables whose name and value are both valid unicode.
///
/// Anything else cannot be represented in the task environment and is skipped.
fn unicode_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter().filter_map(|(key, value)| {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                tracing::debug!(
                    key = %key.unwrap_or_else(|raw| raw.to_string_lossy().into_owned()),
                    "Skipping host variable that is not valid unicode"
                );
                None
            }
        }
    })
}

/// Accumulates the inputs of a [`TaskEnvironment`].
#[derive(Debug, Default)]
pub struct TaskEnvBuilder {
    node_values: HashMap<String, String>,
    datacenter: String,
    task_name: Option<String>,
    task_meta: HashMap<String, String>,
    task_env: HashMap<String, String>,
    alloc_dir: Option<PathBuf>,
    local_dir: Option<PathBuf>,
    secrets_dir: Option<PathBuf>,
    resources: Option<Resources>,
    alloc: Option<AllocVars>,
    vault_token: Option<SecretString>,
    inject_vault_token: bool,
    host_env: HashMap<String, String>,
}

#[derive(Debug)]
struct AllocVars {
    id: String,
    name: String,
    index: i64,
    job_name: String,
    group_name: String,
}

impl TaskEnvBuilder {
    pub fn new(node: &Node) -> Self {
        Self {
            node_values: node_values(node),
            datacenter: node.datacenter.clone(),
            ..Self::default()
        }
    }

    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn with_task_meta(mut self, meta: HashMap<String, String>) -> Self {
        self.task_meta = meta;
        self
    }

    /// Variables the task declares itself. Values may use `${...}` interpolation.
    pub fn with_env_vars(mut self, env: HashMap<String, String>) -> Self {
        self.task_env = env;
        self
    }

    pub fn with_dirs(mut self, alloc: &Path, local: &Path, secrets: &Path) -> Self {
        self.alloc_dir = Some(alloc.to_path_buf());
        self.local_dir = Some(local.to_path_buf());
        self.secrets_dir = Some(secrets.to_path_buf());
        self
    }

    pub fn with_resources(mut self, resources: &Resources) -> Self {
        self.resources = Some(resources.clone());
        self
    }

    pub fn with_alloc(mut self, alloc: &Allocation) -> Self {
        self.alloc = Some(AllocVars {
            id: alloc.id.clone(),
            name: alloc.name.clone(),
            index: alloc.index(),
            job_name: alloc.job.name.clone(),
            group_name: alloc.task_group.clone(),
        });
        self
    }

    /// Set the secret-store token, exposing it as `VAULT_TOKEN` when `inject` is set.
    pub fn with_vault_token(mut self, token: SecretString, inject: bool) -> Self {
        self.vault_token = Some(token);
        self.inject_vault_token = inject;
        self
    }

    /// Host variables to fall back on, minus any named in `denylist`.
    pub fn with_host_env<I>(mut self, vars: I, denylist: &[String]) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.host_env = vars
            .into_iter()
            .filter(|(key, _)| !denylist.iter().any(|denied| denied == key))
            .collect();
        self
    }

    /// Fold every input into the final view.
    ///
    /// Derived variables come first, task-declared variables override them,
    /// and host variables only fill keys that are still absent.
    pub fn build(self) -> TaskEnvironment {
        let mut env = HashMap::new();

        for (key, value) in &self.task_meta {
            env.insert(
                format!("{META_PREFIX}{}", key.to_uppercase()),
                value.clone(),
            );
        }
        if let Some(name) = &self.task_name {
            env.insert(TASK_NAME.to_string(), name.clone());
        }
        if !self.datacenter.is_empty() {
            env.insert(DATACENTER.to_string(), self.datacenter.clone());
        }

        for (key, dir) in [
            (ALLOC_DIR, &self.alloc_dir),
            (TASK_LOCAL_DIR, &self.local_dir),
            (TASK_SECRETS_DIR, &self.secrets_dir),
        ] {
            if let Some(dir) = dir {
                env.insert(key.to_string(), dir.display().to_string());
            }
        }

        if let Some(resources) = &self.resources {
            env.insert(MEMORY_LIMIT.to_string(), resources.memory_mb.to_string());
            env.insert(CPU_LIMIT.to_string(), resources.cpu.to_string());
            for network in &resources.networks {
                for port in network.ports() {
                    let label = &port.label;
                    env.insert(format!("{IP_PREFIX}{label}"), network.ip.clone());
                    env.insert(format!("{PORT_PREFIX}{label}"), port.value.to_string());
                    env.insert(format!("{HOST_PORT_PREFIX}{label}"), port.value.to_string());
                    env.insert(
                        format!("{ADDR_PREFIX}{label}"),
                        format!("{}:{}", network.ip, port.value),
                    );
                }
            }
        }

        if let Some(alloc) = &self.alloc {
            env.insert(ALLOC_ID.to_string(), alloc.id.clone());
            env.insert(ALLOC_NAME.to_string(), alloc.name.clone());
            env.insert(ALLOC_INDEX.to_string(), alloc.index.to_string());
            env.insert(JOB_NAME.to_string(), alloc.job_name.clone());
            env.insert(GROUP_NAME.to_string(), alloc.group_name.clone());
        }

        if self.inject_vault_token
            && let Some(token) = &self.vault_token
        {
            env.insert(VAULT_TOKEN.to_string(), token.expose_secret().to_string());
        }

        // Interpolate against the derived view so task values can reference it.
        let derived = TaskEnvironment {
            env,
            node_values: self.node_values,
            alloc_dir: self.alloc_dir,
            local_dir: self.local_dir,
            secrets_dir: self.secrets_dir,
        };
        let overrides: Vec<(String, String)> = self
            .task_env
            .iter()
            .map(|(key, value)| (key.clone(), derived.replace_env(value)))
            .collect();

        let mut view = derived;
        view.env.extend(overrides);
        for (key, value) in self.host_env {
            view.env.entry(key).or_insert(value);
        }
        view
    }
}

/// Resolved, immutable environment of one task.
#[derive(Debug, Clone, Default)]
pub struct TaskEnvironment {
    env: HashMap<String, String>,
    node_values: HashMap<String, String>,
    alloc_dir: Option<PathBuf>,
    local_dir: Option<PathBuf>,
    secrets_dir: Option<PathBuf>,
}

impl TaskEnvironment {
    /// Variable name to value.
    pub fn env_map(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Variables as sorted `KEY=value` strings.
    pub fn list(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        list.sort();
        list
    }

    pub fn alloc_dir(&self) -> Option<&Path> {
        self.alloc_dir.as_deref()
    }

    pub fn local_dir(&self) -> Option<&Path> {
        self.local_dir.as_deref()
    }

    pub fn secrets_dir(&self) -> Option<&Path> {
        self.secrets_dir.as_deref()
    }

    /// Substitute `${key}` references with task variables or node values.
    ///
    /// Unknown keys are left as written.
    pub fn replace_env(&self, input: &str) -> String {
        INTERPOLATION
            .replace_all(input, |caps: &Captures<'_>| {
                let key = &caps[1];
                self.env
                    .get(key)
                    .or_else(|| self.node_values.get(key))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Interpolate every string in `items`.
    pub fn parse_and_replace(&self, items: &[String]) -> Vec<String> {
        items.iter().map(|item| self.replace_env(item)).collect()
    }
}

fn node_values(node: &Node) -> HashMap<String, String> {
    let mut values = HashMap::from([
        (NODE_ID_KEY.to_string(), node.id.clone()),
        (NODE_NAME_KEY.to_string(), node.name.clone()),
        (NODE_DC_KEY.to_string(), node.datacenter.clone()),
        (NODE_CLASS_KEY.to_string(), node.node_class.clone()),
    ]);
    for (key, value) in &node.attributes {
        values.insert(format!("{NODE_ATTR_PREFIX}{key}"), value.clone());
    }
    for (key, value) in &node.meta {
        values.insert(format!("{NODE_META_PREFIX}{key}"), value.clone());
    }
    values
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::task::{NetworkResource, Port};

    fn node() -> Node {
        let mut node = Node::new("node-1", "worker-a").with_attribute("kernel.name", "linux");
        node.datacenter = "dc1".into();
        node.node_class = "compute".into();
        node.meta.insert("rack".into(), "r12".into());
        node
    }

    #[test]
    fn derived_variables_are_set() {
        let resources = Resources {
            cpu: 500,
            memory_mb: 256,
            networks: vec![NetworkResource {
                ip: "10.0.0.5".into(),
                reserved_ports: vec![Port {
                    label: "admin".into(),
                    value: 8081,
                }],
                dynamic_ports: vec![Port {
                    label: "http".into(),
                    value: 23456,
                }],
            }],
        };
        let env = TaskEnvBuilder::new(&node())
            .with_task_name("web")
            .with_task_meta(HashMap::from([("owner".to_string(), "ops".to_string())]))
            .with_resources(&resources)
            .build();

        assert_eq!(env.get(TASK_NAME), Some("web"));
        assert_eq!(env.get(DATACENTER), Some("dc1"));
        assert_eq!(env.get("TASK_META_OWNER"), Some("ops"));
        assert_eq!(env.get(MEMORY_LIMIT), Some("256"));
        assert_eq!(env.get(CPU_LIMIT), Some("500"));
        assert_eq!(env.get("TASK_PORT_http"), Some("23456"));
        assert_eq!(env.get("TASK_IP_admin"), Some("10.0.0.5"));
        assert_eq!(env.get("TASK_ADDR_http"), Some("10.0.0.5:23456"));
        assert_eq!(env.get("TASK_HOST_PORT_admin"), Some("8081"));
    }

    #[test]
    fn task_vars_override_derived_and_host_fills_gaps() {
        let host = vec![
            ("TASK_NAME".to_string(), "from-host".to_string()),
            ("HOME".to_string(), "/home/agent".to_string()),
            ("GREETING".to_string(), "host".to_string()),
        ];
        let env = TaskEnvBuilder::new(&node())
            .with_task_name("web")
            .with_env_vars(HashMap::from([(
                "GREETING".to_string(),
                "hello from ${TASK_NAME}".to_string(),
            )]))
            .with_host_env(host, &[])
            .build();

        assert_eq!(env.get("TASK_NAME"), Some("web"));
        assert_eq!(env.get("GREETING"), Some("hello from web"));
        assert_eq!(env.get("HOME"), Some("/home/agent"));
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_host_vars_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let host = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("BAD_VALUE"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![b'K', 0xff]), OsString::from("bad key")),
        ];
        let vars: Vec<_> = unicode_vars(host.clone()).collect();
        assert_eq!(vars, vec![("PATH".to_string(), "/usr/bin".to_string())]);

        let env = TaskEnvBuilder::new(&node())
            .with_host_env(unicode_vars(host), &[])
            .build();
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.get("BAD_VALUE"), None);
    }

    #[test]
    fn host_env_honors_denylist() {
        let host = vec![
            ("VAULT_TOKEN".to_string(), "s.host".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let env = TaskEnvBuilder::new(&node())
            .with_host_env(host, &["VAULT_TOKEN".to_string()])
            .build();
        assert_eq!(env.get("VAULT_TOKEN"), None);
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
    }

    #[test]
    fn replace_env_resolves_node_values_and_keeps_unknown() {
        let env = TaskEnvBuilder::new(&node()).with_task_name("web").build();
        assert_eq!(
            env.replace_env("${node.unique.name}/${attr.kernel.name}/${meta.rack}/${node.class}"),
            "worker-a/linux/r12/compute"
        );
        assert_eq!(env.replace_env("${TASK_NAME}-${nope}"), "web-${nope}");
        assert_eq!(env.replace_env("no refs"), "no refs");
    }

    #[test]
    fn vault_token_injected_only_when_requested() {
        let env = TaskEnvBuilder::new(&node())
            .with_vault_token(SecretString::from("s.abc".to_string()), true)
            .build();
        assert_eq!(env.get(VAULT_TOKEN), Some("s.abc"));

        let env = TaskEnvBuilder::new(&node())
            .with_vault_token(SecretString::from("s.abc".to_string()), false)
            .build();
        assert_eq!(env.get(VAULT_TOKEN), None);
    }

    #[test]
    fn list_is_sorted() {
        let env = TaskEnvBuilder::new(&Node::default())
            .with_env_vars(HashMap::from([
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ]))
            .build();
        assert_eq!(env.list(), vec!["A=1".to_string(), "B=2".to_string()]);
    }
}
