//! Task environment scenarios across driver isolation modes.
//!
//! Host-variable propagation is checked with `PATH`, which is set in every
//! environment the test suite runs in.

use std::collections::HashMap;
use std::path::Path;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use taskdriver::allocdir::{
    SHARED_ALLOC_CONTAINER_PATH, TASK_LOCAL_CONTAINER_PATH, TASK_SECRETS_CONTAINER_PATH, TaskDir,
};
use taskdriver::driver::mock::MockDriver;
use taskdriver::node::Node;
use taskdriver::task::{Allocation, Job, Task, TaskGroup, Vault};
use taskdriver::{
    AgentConfig, Driver, DriverError, DriverRegistry, FsIsolation, config::ENV_DENYLIST_KEY,
    get_task_env,
};

fn task_dir() -> TaskDir {
    TaskDir::new(Path::new("/var/lib/agent/alloc/a1"), "web")
}

fn node() -> Node {
    let mut node = Node::new("node-1", "worker-a").with_attribute("arch", "amd64");
    node.datacenter = "dc1".into();
    node
}

/// Registry whose only driver reports `isolation`.
fn registry_with(isolation: FsIsolation) -> DriverRegistry {
    DriverRegistry::new().register("isolated", move |ctx| {
        Box::new(MockDriver::new(ctx).with_fs_isolation(isolation)) as Box<dyn Driver>
    })
}

#[test]
fn no_isolation_uses_host_paths_and_host_env() {
    let dir = task_dir();
    let task = Task::new("web", "mock_driver");

    let env = get_task_env(&dir, &node(), &task, None, &AgentConfig::default(), None).unwrap();

    assert_eq!(env.alloc_dir(), Some(dir.shared_alloc_dir.as_path()));
    assert_eq!(env.local_dir(), Some(dir.local_dir.as_path()));
    assert_eq!(env.secrets_dir(), Some(dir.secrets_dir.as_path()));
    assert_eq!(
        env.get("TASK_ALLOC_DIR"),
        Some(dir.shared_alloc_dir.display().to_string().as_str())
    );
    assert!(env.get("PATH").is_some());
}

#[test]
fn image_isolation_uses_canonical_paths_without_host_env() {
    let task = Task::new("web", "isolated");
    let env = registry_with(FsIsolation::Image)
        .task_env(&task_dir(), &node(), &task, None, &AgentConfig::default(), None)
        .unwrap();

    assert_eq!(env.alloc_dir(), Some(Path::new(SHARED_ALLOC_CONTAINER_PATH)));
    assert_eq!(env.local_dir(), Some(Path::new(TASK_LOCAL_CONTAINER_PATH)));
    assert_eq!(env.secrets_dir(), Some(Path::new(TASK_SECRETS_CONTAINER_PATH)));
    assert_eq!(env.get("TASK_LOCAL_DIR"), Some("/local"));
    assert_eq!(env.get("PATH"), None);

    // Every variable is one this builder derived.
    for key in env.env_map().keys() {
        assert!(key.starts_with("TASK_"), "unexpected host variable {key}");
    }
}

#[test]
fn builtin_docker_is_image_isolated() {
    let task = Task::new("web", "docker");
    let env = get_task_env(&task_dir(), &node(), &task, None, &AgentConfig::default(), None)
        .unwrap();
    assert_eq!(env.alloc_dir(), Some(Path::new("/alloc")));
    assert_eq!(env.get("PATH"), None);
}

#[test]
fn process_isolation_propagates_host_env_minus_denylist() {
    let task = Task::new("web", "isolated");
    let registry = registry_with(FsIsolation::Process);

    let env = registry
        .task_env(&task_dir(), &node(), &task, None, &AgentConfig::default(), None)
        .unwrap();
    assert_eq!(env.alloc_dir(), Some(Path::new("/alloc")));
    assert!(env.get("PATH").is_some());

    let config = AgentConfig::default().with_option(ENV_DENYLIST_KEY, "PATH, HOME");
    let env = registry
        .task_env(&task_dir(), &node(), &task, None, &config, None)
        .unwrap();
    assert_eq!(env.get("PATH"), None);
    assert_eq!(env.get("HOME"), None);
}

#[test]
fn unknown_driver_fails_with_its_name() {
    let task = Task::new("web", "lxc");
    let err = get_task_env(&task_dir(), &node(), &task, None, &AgentConfig::default(), None)
        .unwrap_err();
    assert!(matches!(err, DriverError::UnknownDriver(ref name) if name == "lxc"));
    assert!(err.to_string().contains("lxc"));
}

#[test]
fn allocation_vault_and_interpolation() {
    let mut task = Task::new("web", "isolated")
        .with_env("LISTEN", "${attr.arch}-${TASK_ALLOC_INDEX}")
        .with_env("UNRESOLVED", "${does.not.exist}")
        .with_vault(Vault {
            policies: vec!["web".into()],
            env: true,
        });
    task.meta = HashMap::from([("tier".to_string(), "frontend".to_string())]);

    let alloc = Allocation {
        id: "5f1c".into(),
        name: "shop.frontend[2]".into(),
        task_group: "frontend".into(),
        job: Job {
            name: "shop".into(),
            meta: HashMap::from([("owner".to_string(), "ops".to_string())]),
            task_groups: vec![TaskGroup {
                name: "frontend".into(),
                meta: HashMap::new(),
                tasks: vec![task.clone()],
            }],
        },
    };

    let env = registry_with(FsIsolation::Image)
        .task_env(
            &task_dir(),
            &node(),
            &task,
            Some(&alloc),
            &AgentConfig::default(),
            Some(SecretString::from("s.token".to_string())),
        )
        .unwrap();

    assert_eq!(env.get("TASK_ALLOC_ID"), Some("5f1c"));
    assert_eq!(env.get("TASK_ALLOC_NAME"), Some("shop.frontend[2]"));
    assert_eq!(env.get("TASK_ALLOC_INDEX"), Some("2"));
    assert_eq!(env.get("TASK_JOB_NAME"), Some("shop"));
    assert_eq!(env.get("TASK_GROUP_NAME"), Some("frontend"));
    assert_eq!(env.get("TASK_META_OWNER"), Some("ops"));
    assert_eq!(env.get("TASK_META_TIER"), Some("frontend"));
    assert_eq!(env.get("TASK_DC"), Some("dc1"));
    assert_eq!(env.get("VAULT_TOKEN"), Some("s.token"));
    assert_eq!(env.get("LISTEN"), Some("amd64-2"));
    assert_eq!(env.get("UNRESOLVED"), Some("${does.not.exist}"));
    assert!(env.list().contains(&"TASK_NAME=web".to_string()));
}

#[test]
fn vault_token_ignored_without_vault_block() {
    let task = Task::new("web", "isolated");
    let env = registry_with(FsIsolation::Image)
        .task_env(
            &task_dir(),
            &node(),
            &task,
            None,
            &AgentConfig::default(),
            Some(SecretString::from("s.token".to_string())),
        )
        .unwrap();
    assert_eq!(env.get("VAULT_TOKEN"), None);
}
