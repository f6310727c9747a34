//! Known namespaces and their convergence state
//!
//! Owned by the reconciler task; nothing else reads or writes it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::watch::NamespaceEvent;

/// One namespace the bundle is distributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceTarget {
    /// Namespace name
    pub name: String,
    /// Last time the watch reported the namespace
    pub last_seen: DateTime<Utc>,
    /// Last time every artifact was written; `None` means never
    pub last_success: Option<DateTime<Utc>>,
    /// Last time writing an artifact failed; `None` means never
    pub last_failure: Option<DateTime<Utc>>,
}

impl NamespaceTarget {
    fn new(name: String, last_seen: DateTime<Utc>) -> Self {
        Self {
            name,
            last_seen,
            last_success: None,
            last_failure: None,
        }
    }

    /// True when the last success is strictly before `t`
    pub fn unsuccessful_since(&self, t: DateTime<Utc>) -> bool {
        self.last_success.map_or(true, |success| success < t)
    }
}

/// What [`NamespaceRegistry::upsert`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting, the namespace is now a candidate
    Inserted,
    /// Already known, only `last_seen` moved
    Refreshed,
    /// Deleted and evicted
    Removed,
    /// Deletion of a name that was never known
    Ignored,
}

/// Mapping from namespace name to target, one entry per name
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    targets: BTreeMap<String, NamespaceTarget>,
}

impl NamespaceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one watch event into the registry
    ///
    /// Re-observing a known namespace keeps its success and failure history,
    /// so a watch reconnect does not turn converged namespaces into candidates.
    pub fn upsert(&mut self, event: &NamespaceEvent) -> Upsert {
        if event.deleted {
            return match self.targets.remove(&event.name) {
                Some(_) => Upsert::Removed,
                None => Upsert::Ignored,
            };
        }

        match self.targets.get_mut(&event.name) {
            Some(target) => {
                target.last_seen = event.observed_at;
                Upsert::Refreshed
            }
            None => {
                self.targets.insert(
                    event.name.clone(),
                    NamespaceTarget::new(event.name.clone(), event.observed_at),
                );
                Upsert::Inserted
            }
        }
    }

    /// Every target whose last success is strictly before `t`, by name
    pub fn unsuccessful_since(&self, t: DateTime<Utc>) -> Vec<&NamespaceTarget> {
        self.targets
            .values()
            .filter(|target| target.unsuccessful_since(t))
            .collect()
    }

    /// Count of targets whose last success is strictly before `t`
    pub fn pending_since(&self, t: DateTime<Utc>) -> usize {
        self.targets
            .values()
            .filter(|target| target.unsuccessful_since(t))
            .count()
    }

    /// Record the outcome of delivering the bundle to `name`
    ///
    /// Returns false when the namespace is no longer known, e.g. because it
    /// was deleted while the operation was in flight.
    pub fn record_result(&mut self, name: &str, success: bool, at: DateTime<Utc>) -> bool {
        let Some(target) = self.targets.get_mut(name) else {
            return false;
        };
        if success {
            target.last_success = Some(at);
        } else {
            target.last_failure = Some(at);
        }
        true
    }

    /// Look up a target
    pub fn get(&self, name: &str) -> Option<&NamespaceTarget> {
        self.targets.get(name)
    }

    /// Number of known namespaces
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no namespace is known
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
