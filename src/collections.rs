//! Collection lifecycle engine (spec.md §4.5): diffs an incoming cluster
//! manifest against a partition's manifest, producing the system events
//! that drive §4.1's hash-table purge and §4.4's flush-time marker
//! rewrite.

use crate::checkpoint::{SystemEvent, SystemEventKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The cluster-wide manifest, as published by the (external) cluster
/// manager and parsed from JSON per spec.md §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterManifest {
    /// Monotonically increasing manifest revision.
    pub revision: u64,
    /// Key separator in effect for named collections.
    pub separator: String,
    /// Collections the cluster currently wants present.
    pub collections: Vec<ClusterCollection>,
}

/// One collection entry within a [`ClusterManifest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCollection {
    /// Collection name.
    pub name: String,
}

/// Lifecycle state of one collection as tracked by a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLifecycle {
    /// Live; present in both the cluster manifest and this partition.
    Open,
    /// Removed from the cluster manifest; purge in progress.
    Deleting,
}

/// Per-partition bookkeeping for one collection.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    /// Revision at which this collection was first observed.
    pub revision_first_seen: u64,
    /// Seqno of the `CreateCollection` event that admitted it.
    pub start_seqno: i64,
    /// Seqno of the `BeginDeleteCollection` event, once deleting.
    pub end_seqno: Option<i64>,
    /// Current lifecycle state.
    pub lifecycle: CollectionLifecycle,
}

/// A single partition's view of the collection manifest, rebuilt on
/// startup from the persisted manifest document (spec.md §6.2).
#[derive(Debug, Clone, Default)]
pub struct CollectionManifest {
    revision: u64,
    separator: String,
    collections: HashMap<String, CollectionEntry>,
}

impl CollectionManifest {
    /// An empty manifest using the given separator (before any cluster
    /// manifest has ever been applied).
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            revision: 0,
            separator: separator.into(),
            collections: HashMap::new(),
        }
    }

    /// Current manifest revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Key separator in effect.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Looks up a collection's current bookkeeping entry.
    pub fn get(&self, name: &str) -> Option<&CollectionEntry> {
        self.collections.get(name)
    }

    /// Whether writes to `name` should currently be accepted (i.e. it is
    /// `Open`, not absent and not already `Deleting`).
    pub fn accepts_writes(&self, name: &str) -> bool {
        matches!(
            self.collections.get(name).map(|e| e.lifecycle),
            Some(CollectionLifecycle::Open)
        )
    }

    /// Diffs `incoming` against the current manifest. For each newly
    /// added collection, emits a `CreateCollection` event (the caller
    /// enqueues it into the checkpoint and passes the assigned seqno back
    /// via [`CollectionManifest::record_created`]); for each removed
    /// collection still `Open`, emits `BeginDeleteCollection` similarly
    /// via [`CollectionManifest::record_deleting`]. A separator change is
    /// reported as a [`SystemEventKind::CollectionsSeparatorChanged`]
    /// pseudo-event with an empty collection name.
    pub fn diff(&self, incoming: &ClusterManifest) -> Vec<SystemEvent> {
        let mut events = Vec::new();
        if incoming.separator != self.separator {
            events.push(SystemEvent {
                kind: SystemEventKind::CollectionsSeparatorChanged,
                collection: Vec::new(),
                revision: incoming.revision,
            });
        }
        for c in &incoming.collections {
            let known = self.collections.get(&c.name);
            let should_create = match known {
                None => true,
                Some(entry) => entry.lifecycle == CollectionLifecycle::Deleting,
            };
            if should_create {
                events.push(SystemEvent {
                    kind: SystemEventKind::CreateCollection,
                    collection: c.name.clone().into_bytes(),
                    revision: incoming.revision,
                });
            }
        }
        let incoming_names: std::collections::HashSet<&str> =
            incoming.collections.iter().map(|c| c.name.as_str()).collect();
        for (name, entry) in &self.collections {
            if entry.lifecycle == CollectionLifecycle::Open && !incoming_names.contains(name.as_str()) {
                events.push(SystemEvent {
                    kind: SystemEventKind::BeginDeleteCollection,
                    collection: name.clone().into_bytes(),
                    revision: incoming.revision,
                });
            }
        }
        events
    }

    /// Records that `CreateCollection(name)` was enqueued at `seqno`.
    pub fn record_created(&mut self, name: &str, revision: u64, seqno: i64) {
        self.collections.insert(
            name.to_string(),
            CollectionEntry {
                revision_first_seen: revision,
                start_seqno: seqno,
                end_seqno: None,
                lifecycle: CollectionLifecycle::Open,
            },
        );
    }

    /// Records that `BeginDeleteCollection(name)` was enqueued at `seqno`.
    pub fn record_deleting(&mut self, name: &str, seqno: i64) {
        if let Some(entry) = self.collections.get_mut(name) {
            entry.lifecycle = CollectionLifecycle::Deleting;
            entry.end_seqno = Some(seqno);
        }
    }

    /// Applies a separator change.
    pub fn record_separator_changed(&mut self, new_separator: impl Into<String>, revision: u64) {
        self.separator = new_separator.into();
        self.revision = revision;
    }

    /// Collections currently being purged.
    pub fn deleting(&self) -> impl Iterator<Item = (&str, &CollectionEntry)> {
        self.collections
            .iter()
            .filter(|(_, e)| e.lifecycle == CollectionLifecycle::Deleting)
            .map(|(name, e)| (name.as_str(), e))
    }

    /// Completes a purge. `reappeared` resolves the source's
    /// underspecified `isCandidate` step (spec.md §9): if the collection
    /// was re-created (is `Open` again) while its old generation was being
    /// purged, the completion is soft (manifest end-seqno updated only);
    /// otherwise it is hard (the entry is dropped entirely). The caller
    /// enqueues the returned event and, on the hard path, removes the
    /// manifest entry; on the soft path the entry is left as `Open`
    /// untouched (it was already recreated by `record_created`).
    pub fn complete_purge(&self, name: &str) -> Option<SystemEvent> {
        let entry = self.collections.get(name)?;
        if entry.lifecycle != CollectionLifecycle::Deleting {
            // Already recreated: the purge scan's generation is stale.
            return Some(SystemEvent {
                kind: SystemEventKind::DeleteCollectionSoft,
                collection: name.as_bytes().to_vec(),
                revision: entry.revision_first_seen,
            });
        }
        Some(SystemEvent {
            kind: SystemEventKind::DeleteCollectionHard,
            collection: name.as_bytes().to_vec(),
            revision: entry.revision_first_seen,
        })
    }

    /// Drops a hard-deleted collection's bookkeeping entry entirely.
    pub fn forget(&mut self, name: &str) {
        self.collections.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(rev: u64, sep: &str, names: &[&str]) -> ClusterManifest {
        ClusterManifest {
            revision: rev,
            separator: sep.to_string(),
            collections: names
                .iter()
                .map(|n| ClusterCollection { name: n.to_string() })
                .collect(),
        }
    }

    #[test]
    fn new_collection_emits_create_event() {
        let manifest = CollectionManifest::new("::");
        let events = manifest.diff(&cluster(1, "::", &["meat"]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SystemEventKind::CreateCollection);
        assert_eq!(events[0].collection, b"meat".to_vec());
    }

    #[test]
    fn removed_collection_emits_begin_delete() {
        let mut manifest = CollectionManifest::new("::");
        manifest.record_created("meat", 1, 10);
        let events = manifest.diff(&cluster(2, "::", &[]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SystemEventKind::BeginDeleteCollection);
    }

    #[test]
    fn separator_change_is_reported() {
        let manifest = CollectionManifest::new("::");
        let events = manifest.diff(&cluster(2, "|", &[]));
        assert!(events
            .iter()
            .any(|e| e.kind == SystemEventKind::CollectionsSeparatorChanged));
    }

    #[test]
    fn purge_completion_is_hard_when_still_deleting() {
        let mut manifest = CollectionManifest::new("::");
        manifest.record_created("meat", 1, 10);
        manifest.record_deleting("meat", 20);
        let event = manifest.complete_purge("meat").unwrap();
        assert_eq!(event.kind, SystemEventKind::DeleteCollectionHard);
    }

    #[test]
    fn purge_completion_is_soft_when_recreated_mid_purge() {
        let mut manifest = CollectionManifest::new("::");
        manifest.record_created("meat", 1, 10);
        manifest.record_deleting("meat", 20);
        manifest.record_created("meat", 3, 30); // recreated before purge finished
        let event = manifest.complete_purge("meat").unwrap();
        assert_eq!(event.kind, SystemEventKind::DeleteCollectionSoft);
    }

    #[test]
    fn accepts_writes_only_while_open() {
        let mut manifest = CollectionManifest::new("::");
        assert!(!manifest.accepts_writes("meat"));
        manifest.record_created("meat", 1, 10);
        assert!(manifest.accepts_writes("meat"));
        manifest.record_deleting("meat", 20);
        assert!(!manifest.accepts_writes("meat"));
    }
}
