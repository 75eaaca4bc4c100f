//! Task directory layout handle.
//!
//! The allocation directory manager owns creating and destroying these
//! directories; drivers only read the paths.

use std::path::{Path, PathBuf};

/// Shared allocation directory as seen from inside an isolated task.
pub const SHARED_ALLOC_CONTAINER_PATH: &str = "/alloc";

/// Task-local directory as seen from inside an isolated task.
pub const TASK_LOCAL_CONTAINER_PATH: &str = "/local";

/// Task secrets directory as seen from inside an isolated task.
pub const TASK_SECRETS_CONTAINER_PATH: &str = "/secrets";

const SHARED_ALLOC_NAME: &str = "alloc";
const LOG_DIR_NAME: &str = "logs";
const TASK_LOCAL_NAME: &str = "local";
const TASK_SECRETS_NAME: &str = "secrets";

/// Host-side paths for one task inside an allocation directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDir {
    /// `<alloc>/<task>`, the task's working directory.
    pub dir: PathBuf,
    /// `<alloc>/alloc`, shared by every task of the allocation.
    pub shared_alloc_dir: PathBuf,
    /// `<alloc>/alloc/logs`.
    pub log_dir: PathBuf,
    /// `<alloc>/<task>/local`.
    pub local_dir: PathBuf,
    /// `<alloc>/<task>/secrets`.
    pub secrets_dir: PathBuf,
}

impl TaskDir {
    /// Compute the layout for `task_name` under `alloc_dir`. Nothing is created.
    pub fn new(alloc_dir: &Path, task_name: &str) -> Self {
        let dir = alloc_dir.join(task_name);
        let shared_alloc_dir = alloc_dir.join(SHARED_ALLOC_NAME);
        Self {
            log_dir: shared_alloc_dir.join(LOG_DIR_NAME),
            local_dir: dir.join(TASK_LOCAL_NAME),
            secrets_dir: dir.join(TASK_SECRETS_NAME),
            shared_alloc_dir,
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_alloc_dir() {
        let td = TaskDir::new(Path::new("/var/lib/agent/alloc/a1"), "web");
        assert_eq!(td.dir, Path::new("/var/lib/agent/alloc/a1/web"));
        assert_eq!(td.shared_alloc_dir, Path::new("/var/lib/agent/alloc/a1/alloc"));
        assert_eq!(td.log_dir, Path::new("/var/lib/agent/alloc/a1/alloc/logs"));
        assert_eq!(td.local_dir, Path::new("/var/lib/agent/alloc/a1/web/local"));
        assert_eq!(td.secrets_dir, Path::new("/var/lib/agent/alloc/a1/web/secrets"));
    }
}
