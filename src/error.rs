//! Error types for the task driver layer.

use crate::driver::CreatedResources;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by drivers and their handles.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("invalid {driver} config field '{field}': {reason}")]
    Validation {
        driver: String,
        field: String,
        reason: String,
    },

    #[error("failed to prepare task: {reason}")]
    Prepare { reason: String, recoverable: bool },

    #[error("failed to start task: {reason}")]
    Start { reason: String, recoverable: bool },

    #[error("task handle '{0}' not found")]
    HandleNotFound(String),

    #[error("invalid task handle '{id}': {reason}")]
    InvalidHandle { id: String, reason: String },

    #[error("failed to clean up {kind} '{id}': {reason}")]
    Cleanup {
        kind: String,
        id: String,
        reason: String,
        recoverable: bool,
    },

    #[error("{operation} not implemented for driver {driver}")]
    NotImplemented {
        driver: String,
        operation: &'static str,
    },

    #[error("update requires a task restart: {0}")]
    UpdateRequiresRestart(String),

    #[error("task operation failed: {0}")]
    Operation(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a caller should react to a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The same operation may succeed if retried with the same inputs.
    Recoverable,
    /// Retrying will not help; surface to the operator.
    Fatal,
    /// The backend lacks the ability. Callers degrade instead of failing.
    Unsupported,
}

impl DriverError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            DriverError::Prepare { recoverable, .. }
            | DriverError::Start { recoverable, .. }
            | DriverError::Cleanup { recoverable, .. } => {
                if *recoverable {
                    DriverErrorKind::Recoverable
                } else {
                    DriverErrorKind::Fatal
                }
            }
            DriverError::NotImplemented { .. } => DriverErrorKind::Unsupported,
            DriverError::Io(..) => DriverErrorKind::Recoverable,
            DriverError::UnknownDriver(..)
            | DriverError::Validation { .. }
            | DriverError::HandleNotFound(..)
            | DriverError::InvalidHandle { .. }
            | DriverError::UpdateRequiresRestart(..)
            | DriverError::Operation(..)
            | DriverError::Docker(..)
            | DriverError::Serialization(..) => DriverErrorKind::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind() == DriverErrorKind::Recoverable
    }

    pub fn is_not_implemented(&self) -> bool {
        self.kind() == DriverErrorKind::Unsupported
    }

    /// Shorthand for an unsupported operation on `driver`.
    pub fn not_implemented(driver: impl Into<String>, operation: &'static str) -> Self {
        DriverError::NotImplemented {
            driver: driver.into(),
            operation,
        }
    }

    /// Shorthand for a validation failure on a single config field.
    pub fn validation(
        driver: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DriverError::Validation {
            driver: driver.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A failed prepare together with whatever it managed to create.
///
/// `created` is always present so the caller can schedule cleanup for the
/// partial progress before retrying.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct PrepareError {
    pub created: CreatedResources,
    #[source]
    pub source: DriverError,
}

impl PrepareError {
    pub fn new(created: CreatedResources, source: DriverError) -> Self {
        Self { created, source }
    }
}

impl From<DriverError> for PrepareError {
    fn from(source: DriverError) -> Self {
        Self::new(CreatedResources::new(), source)
    }
}

/// Persisted runner state errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read task state {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to write task state {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("no handle recorded for task {0}")]
    NoHandle(String),

    #[error("task {0} has not been prepared")]
    NotPrepared(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_errors_classify_by_flag() {
        let err = DriverError::Cleanup {
            kind: "image".into(),
            id: "img1".into(),
            reason: "in use".into(),
            recoverable: true,
        };
        assert!(err.is_recoverable());

        let err = DriverError::Cleanup {
            kind: "image".into(),
            id: "img1".into(),
            reason: "permission denied".into(),
            recoverable: false,
        };
        assert_eq!(err.kind(), DriverErrorKind::Fatal);
    }

    #[test]
    fn not_implemented_is_unsupported() {
        let err = DriverError::not_implemented("raw_exec", "stats");
        assert!(err.is_not_implemented());
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "stats not implemented for driver raw_exec");
    }

    #[test]
    fn unknown_driver_names_the_driver() {
        let err = DriverError::UnknownDriver("lxc".into());
        assert_eq!(err.to_string(), "unknown driver 'lxc'");
        assert_eq!(err.kind(), DriverErrorKind::Fatal);
    }

    #[test]
    fn prepare_error_keeps_partial_ledger() {
        let mut created = CreatedResources::new();
        created.add("image", "img1");
        let err = PrepareError::new(
            created,
            DriverError::Prepare {
                reason: "device allocation failed".into(),
                recoverable: true,
            },
        );
        assert!(err.created.contains("image", "img1"));
        assert_eq!(
            err.to_string(),
            "failed to prepare task: device allocation failed"
        );
    }
}
