//! Description of the host node the agent runs on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Host node descriptor. Attributes are written by fingerprinting
/// (e.g. `driver.docker = "1"`) and read when building task environments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub datacenter: String,
    pub node_class: String,
    pub attributes: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
