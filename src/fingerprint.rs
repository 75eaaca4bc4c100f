//! Capability detection contract every driver composes.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::error::DriverError;
use crate::node::Node;

/// Detects whether a capability is usable on this host.
#[async_trait]
pub trait Fingerprint: Send + Sync {
    /// Probe the host, recording findings as node attributes.
    ///
    /// Returns whether the capability applies to this node.
    async fn fingerprint(&self, config: &AgentConfig, node: &mut Node)
    -> Result<bool, DriverError>;

    /// `Some(interval)` if the probe should be re-run periodically.
    fn periodic(&self) -> Option<Duration> {
        None
    }
}
