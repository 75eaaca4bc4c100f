//! Ledger of side effects a driver created while preparing a task.
//!
//! Drivers add an entry for every resource they create (pulled images,
//! allocated devices, temp files) so that cleanup, possibly run by a
//! different agent process after a crash, reclaims exactly what was created.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resources created by a driver, keyed by kind (e.g. `"image"`).
///
/// Ids within a kind are unique and kept in discovery order. A kind never
/// maps to an empty list: removing the last id removes the kind.
///
/// "No ledger" is expressed as `Option<CreatedResources>::None` by callers;
/// cloning an `Option` preserves that distinction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PersistedResources")]
pub struct CreatedResources {
    resources: BTreeMap<String, Vec<String>>,
}

/// On-disk shape. Normalized through [`CreatedResources::add`] on load so a
/// hand-edited or older state file cannot reintroduce duplicates or empty kinds.
#[derive(Deserialize)]
struct PersistedResources {
    #[serde(default)]
    resources: BTreeMap<String, Vec<String>>,
}

impl From<PersistedResources> for CreatedResources {
    fn from(persisted: PersistedResources) -> Self {
        let mut created = CreatedResources::new();
        for (kind, ids) in persisted.resources {
            for id in ids {
                created.add(kind.as_str(), id);
            }
        }
        created
    }
}

impl CreatedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` under `kind`. Adding an id that is already present is a no-op.
    pub fn add(&mut self, kind: impl Into<String>, id: impl Into<String>) {
        let id = id.into();
        let ids = self.resources.entry(kind.into()).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Remove `id` from `kind`. Returns whether anything was removed.
    ///
    /// Removes the entire kind if `id` was its last entry.
    pub fn remove(&mut self, kind: &str, id: &str) -> bool {
        let Some(ids) = self.resources.get_mut(kind) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|existing| existing == id) else {
            return false;
        };
        ids.remove(pos);
        if ids.is_empty() {
            self.resources.remove(kind);
        }
        true
    }

    /// Union `other` into this ledger, skipping ids already present.
    ///
    /// `None` is a no-op. Merging the same ledger twice has the same effect
    /// as merging it once.
    pub fn merge(&mut self, other: Option<&CreatedResources>) {
        let Some(other) = other else {
            return;
        };
        for (kind, ids) in &other.resources {
            for id in ids {
                self.add(kind.as_str(), id.as_str());
            }
        }
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.resources
            .get(kind)
            .is_some_and(|ids| ids.iter().any(|existing| existing == id))
    }

    /// Ids recorded under `kind`, in discovery order.
    pub fn get(&self, kind: &str) -> Option<&[String]> {
        self.resources.get(kind).map(Vec::as_slice)
    }

    /// Iterate `(kind, ids)` pairs in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.resources
            .iter()
            .map(|(kind, ids)| (kind.as_str(), ids.as_slice()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Total number of ids across all kinds.
    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }
}

impl<K, I> FromIterator<(K, I)> for CreatedResources
where
    K: Into<String>,
    I: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, I)>>(iter: T) -> Self {
        let mut created = CreatedResources::new();
        for (kind, id) in iter {
            created.add(kind, id);
        }
        created
    }
}
