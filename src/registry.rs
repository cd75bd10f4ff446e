//! Bookkeeping of which local subject mirrors which remote node.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::graph::SubjectId;
use crate::ua::NodeId;

/// How long a deleted node id is remembered. A resync inside this window
/// must not re-materialise the subject.
const RECENTLY_DELETED_EXPIRY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Inner {
    by_node: HashMap<NodeId, SubjectId>,
    by_subject: HashMap<SubjectId, NodeId>,
    refcounts: HashMap<SubjectId, u32>,
    recently_deleted: HashMap<NodeId, Instant>,
}

/// Bidirectional map between tracked subjects and their remote node
/// identifiers.
///
/// Both directions are updated under one lock, so the mapping is a
/// bijection at every observable point. Tracking is reference-counted:
/// a subject reachable through several structural slots is tracked once
/// and cleaned up when the last reference goes away.
#[derive(Default)]
pub struct SubjectRegistry {
    inner: Mutex<Inner>,
}

impl SubjectRegistry {
    pub fn new() -> Self {
        SubjectRegistry::default()
    }

    /// Track `subject` under `node_id`. Returns true iff this is the
    /// first reference.
    pub fn track(&self, subject: SubjectId, node_id: NodeId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.refcounts.entry(subject).or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        if let Some(previous) = inner.by_node.insert(node_id.clone(), subject)
        {
            if previous != subject {
                warn!(
                    node = %node_id,
                    "node id was already tracked by another subject"
                );
                inner.by_subject.remove(&previous);
                inner.refcounts.remove(&previous);
            }
        }
        inner.by_subject.insert(subject, node_id);
        true
    }

    /// Drop one reference. Returns true iff this was the last one and
    /// the subject is no longer tracked.
    pub fn untrack(&self, subject: SubjectId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(count) = inner.refcounts.get_mut(&subject) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        inner.refcounts.remove(&subject);
        if let Some(node_id) = inner.by_subject.remove(&subject) {
            inner.by_node.remove(&node_id);
        }
        true
    }

    /// Atomically rename the node id a subject is tracked under, in both
    /// directions. Used when collection compaction shifts indices.
    pub fn update_external_id(
        &self,
        subject: SubjectId,
        new_node_id: NodeId,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(old) = inner.by_subject.get(&subject).cloned() else {
            return false;
        };
        if old == new_node_id {
            return true;
        }
        if inner.by_node.contains_key(&new_node_id) {
            warn!(
                node = %new_node_id,
                "rename target is already tracked"
            );
            return false;
        }
        inner.by_node.remove(&old);
        inner.by_node.insert(new_node_id.clone(), subject);
        inner.by_subject.insert(subject, new_node_id);
        true
    }

    /// Drop a subject regardless of its reference count. Used when the
    /// server deletes a node that several parents shared.
    pub fn purge(&self, subject: SubjectId) -> Option<NodeId> {
        let mut inner = self.inner.lock().unwrap();
        inner.refcounts.remove(&subject);
        let node_id = inner.by_subject.remove(&subject);
        if let Some(node_id) = &node_id {
            inner.by_node.remove(node_id);
        }
        node_id
    }

    pub fn get_subject(&self, node_id: &NodeId) -> Option<SubjectId> {
        self.inner.lock().unwrap().by_node.get(node_id).copied()
    }

    pub fn get_external_id(&self, subject: SubjectId) -> Option<NodeId> {
        self.inner
            .lock()
            .unwrap()
            .by_subject
            .get(&subject)
            .cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap().by_subject.len()
    }

    /// Snapshot of every tracked subject and its node id.
    pub fn tracked_subjects(&self) -> Vec<(SubjectId, NodeId)> {
        self.inner
            .lock()
            .unwrap()
            .by_subject
            .iter()
            .map(|(subject, node_id)| (*subject, node_id.clone()))
            .collect()
    }

    /// Remember that local code deleted the subject mapped to `node_id`.
    pub fn mark_recently_deleted(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .recently_deleted
            .retain(|_, at| now.duration_since(*at) < RECENTLY_DELETED_EXPIRY);
        inner.recently_deleted.insert(node_id, now);
    }

    pub fn was_recently_deleted(&self, node_id: &NodeId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .recently_deleted
            .retain(|_, at| now.duration_since(*at) < RECENTLY_DELETED_EXPIRY);
        inner.recently_deleted.contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (SubjectId, NodeId) {
        (SubjectId(7), NodeId::string(2, "Plant/Motors[0]"))
    }

    #[test]
    fn track_is_reference_counted() {
        let registry = SubjectRegistry::new();
        let (subject, node) = ids();
        assert!(registry.track(subject, node.clone()));
        assert!(!registry.track(subject, node.clone()));
        assert_eq!(registry.get_subject(&node), Some(subject));

        assert!(!registry.untrack(subject));
        assert!(registry.untrack(subject));
        assert_eq!(registry.get_subject(&node), None);
        assert_eq!(registry.get_external_id(subject), None);
    }

    #[test]
    fn rename_updates_both_directions() {
        let registry = SubjectRegistry::new();
        let (subject, node) = ids();
        registry.track(subject, node.clone());

        let renamed = node.with_collection_index(4).unwrap();
        assert!(registry.update_external_id(subject, renamed.clone()));
        assert_eq!(registry.get_subject(&renamed), Some(subject));
        assert_eq!(registry.get_subject(&node), None);
        assert_eq!(registry.get_external_id(subject), Some(renamed));
    }

    #[test]
    fn recently_deleted_is_remembered() {
        let registry = SubjectRegistry::new();
        let (_, node) = ids();
        assert!(!registry.was_recently_deleted(&node));
        registry.mark_recently_deleted(node.clone());
        assert!(registry.was_recently_deleted(&node));
    }
}
