//! Reconciliation of remote structural changes against the local graph.
//!
//! Two inputs drive it: `ModelChangeEvent`s from the server, and the
//! periodic full resync the coordinator runs when events may have been
//! missed. Both funnel into the same per-property reconciliation
//! routines.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::graph::{
    GraphStore, PropertyKind, PropertyRef, PropertyValue, SubjectId,
};
use crate::loader::{RemoteChangeWindow, SubjectLoader, NODE_DATA_KEY};
use crate::registry::SubjectRegistry;
use crate::session::{SessionRef, SessionSlot};
use crate::subscription::PlannedItem;
use crate::ua::{
    split_indexed_name, BrowseItem, ModelChangeEvent, ModelChangeVerb,
    NodeClass, NodeId,
};

/// How far up the server hierarchy an added node's ancestry is followed
/// before giving up on finding a tracked subject.
const MAX_ANCESTOR_DEPTH: usize = 8;

/// Structural-property description snapshotted from the graph.
struct StructuralSlot {
    name: String,
    kind: PropertyKind,
    container: Option<NodeId>,
}

/// Applies remote structural changes to the local graph.
pub struct ChangeReceiver {
    graph: GraphStore,
    registry: Arc<SubjectRegistry>,
    loader: Arc<SubjectLoader>,
    slot: Arc<SessionSlot>,
    window: Arc<RemoteChangeWindow>,
    /// Enables the recently-deleted filter on additions.
    publishing_enabled: bool,
}

impl ChangeReceiver {
    pub fn new(
        graph: GraphStore,
        registry: Arc<SubjectRegistry>,
        loader: Arc<SubjectLoader>,
        slot: Arc<SessionSlot>,
        publishing_enabled: bool,
    ) -> Self {
        let window = Arc::clone(loader.window());
        ChangeReceiver {
            graph,
            registry,
            loader,
            slot,
            window,
            publishing_enabled,
        }
    }

    /// Apply one model-change event.
    pub fn handle_event(&self, event: &ModelChangeEvent) {
        let Some(session) = self.connected_session() else {
            return;
        };
        let mut planned = Vec::new();
        {
            let _guard = self.window.enter();
            match event.verb {
                ModelChangeVerb::NodeAdded
                | ModelChangeVerb::ReferenceAdded => {
                    self.node_added(&session, &event.affected, &mut planned);
                }
                ModelChangeVerb::NodeDeleted
                | ModelChangeVerb::ReferenceDeleted => {
                    self.node_deleted(&event.affected);
                }
            }
        }
        // The explicit read supplies current values; items are installed
        // only after it, outside the remote-change window, so a stale
        // initial notification cannot overwrite them.
        self.loader.read_initial(&session, &planned);
        self.loader.install(&session, planned);
    }

    /// Reconcile every structural property of every tracked subject
    /// against the server. The fallback when change events are
    /// unavailable or an outage may have swallowed some.
    pub fn resync(&self) {
        let Some(session) = self.connected_session() else {
            return;
        };
        let mut planned = Vec::new();
        {
            let _guard = self.window.enter();
            for (subject, _) in self.registry.tracked_subjects() {
                for slot in self.structural_slots(subject) {
                    self.reconcile_slot(&session, subject, &slot, &mut planned);
                }
            }
        }
        self.loader.read_initial(&session, &planned);
        self.loader.install(&session, planned);
    }

    fn connected_session(&self) -> Option<Arc<SessionRef>> {
        self.slot
            .load()
            .filter(|session| session.is_connected())
    }

    fn structural_slots(&self, subject: SubjectId) -> Vec<StructuralSlot> {
        self.graph.with(|graph| {
            graph
                .subject(subject)
                .map(|entry| {
                    entry
                        .properties()
                        .iter()
                        .filter(|property| {
                            !matches!(
                                property.kind(),
                                PropertyKind::Scalar(_)
                            )
                        })
                        .map(|property| StructuralSlot {
                            name: property.name().to_string(),
                            kind: property.kind().clone(),
                            container: property
                                .node_id(NODE_DATA_KEY)
                                .cloned(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn reconcile_slot(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        slot: &StructuralSlot,
        planned: &mut Vec<PlannedItem>,
    ) {
        match slot.kind {
            PropertyKind::Reference => {
                self.reconcile_reference(session, subject, &slot.name, planned)
            }
            PropertyKind::Collection => {
                self.reconcile_collection(session, subject, &slot.name, planned)
            }
            PropertyKind::Dictionary => {
                self.reconcile_dictionary(session, subject, &slot.name, planned)
            }
            PropertyKind::Scalar(_) => {}
        }
    }

    /// Route an added node to the property of its nearest tracked
    /// ancestor.
    fn node_added(
        &self,
        session: &Arc<SessionRef>,
        node_id: &NodeId,
        planned: &mut Vec<PlannedItem>,
    ) {
        // The server replays its address space when event publishing
        // starts; everything already tracked is not news.
        if self.registry.get_subject(node_id).is_some() {
            return;
        }
        let Ok(info) = session.read_node_info(node_id) else {
            return;
        };
        let Some(direct_parent) = info.parent.clone() else {
            return;
        };

        let mut ancestor_node = direct_parent.clone();
        let mut tracked = self.registry.get_subject(&ancestor_node);
        let mut depth = 0;
        while tracked.is_none() && depth < MAX_ANCESTOR_DEPTH {
            let Ok(ancestor_info) = session.read_node_info(&ancestor_node)
            else {
                return;
            };
            match ancestor_info.parent {
                Some(parent) => {
                    ancestor_node = parent;
                    tracked = self.registry.get_subject(&ancestor_node);
                }
                None => break,
            }
            depth += 1;
        }
        let Some(subject) = tracked else {
            debug!(node = %node_id, "added node has no tracked ancestor");
            return;
        };

        for slot in self.structural_slots(subject) {
            let matched = match &slot.kind {
                PropertyKind::Reference => slot.name == info.browse_name,
                PropertyKind::Collection => {
                    split_indexed_name(&info.browse_name)
                        .is_some_and(|(base, _)| base == slot.name)
                }
                PropertyKind::Dictionary => {
                    slot.container.as_ref() == Some(&direct_parent)
                }
                PropertyKind::Scalar(_) => false,
            };
            if matched {
                self.reconcile_slot(session, subject, &slot, planned);
                return;
            }
        }
        debug!(
            node = %node_id,
            name = %info.browse_name,
            "added node matches no structural property"
        );
    }

    /// A deleted node detaches its subject from every parent, then the
    /// orphaned subtree is cleaned up.
    fn node_deleted(&self, node_id: &NodeId) {
        let Some(subject) = self.registry.get_subject(node_id) else {
            return;
        };
        let parents = self.graph.with(|graph| {
            graph
                .subject(subject)
                .map(|entry| entry.parents().to_vec())
                .unwrap_or_default()
        });
        for parent in parents {
            let property =
                PropertyRef::property(parent.subject, &parent.property);
            let kind = self.graph.with(|graph| {
                graph
                    .property(&property)
                    .map(|slot| slot.kind().clone())
            });
            match kind {
                Some(PropertyKind::Reference) => {
                    self.graph.with(|graph| {
                        graph.enter_remote_change();
                        graph.set_reference(&property, None);
                        graph.exit_remote_change();
                    });
                }
                Some(PropertyKind::Collection) => {
                    self.remove_collection_element(&property, subject);
                }
                Some(PropertyKind::Dictionary) => {
                    self.remove_dictionary_entries(&property, subject);
                }
                _ => {}
            }
        }
        self.cleanup_subtree(subject);
    }

    /// Remove one collection element and shift the registered node ids
    /// of every surviving element above it down by one.
    fn remove_collection_element(
        &self,
        property: &PropertyRef,
        subject: SubjectId,
    ) {
        let local = self.local_collection(property);
        let removed_index = local
            .iter()
            .find(|(_, id)| *id == subject)
            .map(|(index, _)| *index);
        self.graph.with(|graph| {
            graph.enter_remote_change();
            graph.collection_remove(property, subject);
            graph.exit_remote_change();
        });
        let Some(removed_index) = removed_index else {
            return;
        };
        // The removed element's registration must be released before a
        // survivor can take over its node id.
        let orphaned = self.graph.with(|graph| {
            graph
                .subject(subject)
                .map(|entry| entry.parents().is_empty())
                .unwrap_or(true)
        });
        if orphaned {
            self.registry.purge(subject);
        }
        for (index, survivor) in local {
            if index <= removed_index || survivor == subject {
                continue;
            }
            let Some(node_id) = self.registry.get_external_id(survivor)
            else {
                continue;
            };
            if let Some(renamed) = node_id.with_collection_index(index - 1) {
                self.registry.update_external_id(survivor, renamed);
            }
        }
    }

    fn remove_dictionary_entries(
        &self,
        property: &PropertyRef,
        subject: SubjectId,
    ) {
        let keys: Vec<String> = self
            .graph
            .with(|graph| graph.dictionary_items(property))
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, id)| *id == subject)
            .map(|(key, _)| key)
            .collect();
        self.graph.with(|graph| {
            graph.enter_remote_change();
            for key in &keys {
                graph.dictionary_remove(property, key);
            }
            graph.exit_remote_change();
        });
    }

    /// Unregister a subject and any descendants left without parents.
    fn cleanup_subtree(&self, subject: SubjectId) {
        let children: Vec<SubjectId> = self.graph.with(|graph| {
            graph
                .subject(subject)
                .map(|entry| {
                    entry
                        .properties()
                        .iter()
                        .flat_map(|property| property.children())
                        .collect()
                })
                .unwrap_or_default()
        });
        self.loader.unregister(subject);
        self.graph.with(|graph| {
            graph.enter_remote_change();
            graph.remove_subject(subject);
            graph.exit_remote_change();
        });
        for child in children {
            let orphaned = self.graph.with(|graph| {
                graph
                    .subject(child)
                    .is_some_and(|entry| entry.parents().is_empty())
            });
            if orphaned {
                self.cleanup_subtree(child);
            }
        }
    }

    /// Local collection state, `(node index, subject)` sorted by index.
    /// Indices come from each element's registered node id, not from
    /// list position, which may lag behind the server after concurrent
    /// edits.
    fn local_collection(
        &self,
        property: &PropertyRef,
    ) -> Vec<(usize, SubjectId)> {
        let items = self
            .graph
            .with(|graph| graph.collection_items(property))
            .unwrap_or_default();
        let mut indexed: Vec<(usize, SubjectId)> = items
            .into_iter()
            .filter_map(|subject| {
                self.registry
                    .get_external_id(subject)
                    .and_then(|node_id| node_id.collection_index())
                    .map(|index| (index, subject))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        indexed
    }

    fn reconcile_reference(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        name: &str,
        planned: &mut Vec<PlannedItem>,
    ) {
        let property = PropertyRef::property(subject, name);
        let Some(parent_node) = self.registry.get_external_id(subject)
        else {
            return;
        };
        let Ok(children) = session.browse(&parent_node) else {
            return;
        };
        let remote = children.into_iter().find(|item| {
            item.browse_name == name && item.node_class == NodeClass::Object
        });
        let local = self.graph.with(|graph| {
            graph.property(&property).and_then(|slot| {
                match slot.value() {
                    PropertyValue::Reference(child) => *child,
                    _ => None,
                }
            })
        });

        match (remote, local) {
            (Some(item), None) => {
                self.attach_reference_child(session, &property, item, planned);
            }
            (Some(item), Some(existing)) => {
                let existing_node = self.registry.get_external_id(existing);
                if existing_node.as_ref() == Some(&item.node_id) {
                    return;
                }
                // Replacement: the server points the slot elsewhere.
                self.detach_reference_child(&property, existing);
                self.attach_reference_child(session, &property, item, planned);
            }
            (None, Some(existing)) => {
                self.detach_reference_child(&property, existing);
            }
            (None, None) => {}
        }
    }

    fn attach_reference_child(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        item: BrowseItem,
        planned: &mut Vec<PlannedItem>,
    ) {
        if self.skip_recently_deleted(&item.node_id) {
            return;
        }
        if item.node_class != NodeClass::Object {
            warn!(node = %item.node_id, "reference target is not an object");
            return;
        }
        let child = self.loader.attach_reference(property, &item.browse_name);
        if let Err(status) =
            self.loader.load(session, child, &item.node_id, planned)
        {
            debug!(node = %item.node_id, %status, "loading new child failed");
        }
    }

    fn detach_reference_child(
        &self,
        property: &PropertyRef,
        existing: SubjectId,
    ) {
        self.graph.with(|graph| {
            graph.enter_remote_change();
            graph.set_reference(property, None);
            graph.exit_remote_change();
        });
        let orphaned = self.graph.with(|graph| {
            graph
                .subject(existing)
                .is_some_and(|entry| entry.parents().is_empty())
        });
        if orphaned {
            self.cleanup_subtree(existing);
        }
    }

    fn reconcile_collection(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        name: &str,
        planned: &mut Vec<PlannedItem>,
    ) {
        let property = PropertyRef::property(subject, name);
        let Some(parent_node) = self.registry.get_external_id(subject)
        else {
            return;
        };
        let flat = self.graph.with(|graph| {
            graph
                .property(&property)
                .is_some_and(|slot| slot.is_flat_layout())
        });

        let container_node = if flat {
            parent_node.clone()
        } else {
            let Ok(children) = session.browse(&parent_node) else {
                return;
            };
            match children.into_iter().find(|item| {
                item.browse_name == name
                    && item.node_class == NodeClass::Object
            }) {
                Some(container) => {
                    self.loader
                        .claim_with_node(&property, &container.node_id);
                    container.node_id
                }
                None => {
                    // Container gone: the remote collection is empty.
                    self.clear_collection(&property);
                    return;
                }
            }
        };

        let Ok(children) = session.browse(&container_node) else {
            return;
        };
        let mut remote: Vec<(usize, BrowseItem)> = children
            .into_iter()
            .filter_map(|item| {
                let index = split_indexed_name(&item.browse_name)
                    .filter(|(base, _)| *base == name)
                    .map(|(_, index)| index);
                index.map(|index| (index, item))
            })
            .collect();
        remote.sort_by_key(|(index, _)| *index);

        let local = self.local_collection(&property);
        let remote_indices: HashSet<usize> =
            remote.iter().map(|(index, _)| *index).collect();
        let local_indices: HashSet<usize> =
            local.iter().map(|(index, _)| *index).collect();

        // Removals run from the highest index down so each reindex step
        // only touches survivors above the removed slot.
        for (index, subject_id) in local.iter().rev() {
            if !remote_indices.contains(index) {
                self.remove_collection_element(&property, *subject_id);
                self.cleanup_if_orphaned(*subject_id);
            }
        }

        for (index, item) in remote {
            if local_indices.contains(&index) {
                continue;
            }
            self.add_collection_element(
                session, &property, index, item, planned,
            );
        }
    }

    fn clear_collection(&self, property: &PropertyRef) {
        let local = self.local_collection(property);
        for (_, subject_id) in local.iter().rev() {
            self.graph.with(|graph| {
                graph.enter_remote_change();
                graph.collection_remove(property, *subject_id);
                graph.exit_remote_change();
            });
            self.cleanup_if_orphaned(*subject_id);
        }
    }

    fn cleanup_if_orphaned(&self, subject: SubjectId) {
        let orphaned = self.graph.with(|graph| {
            graph
                .subject(subject)
                .is_some_and(|entry| entry.parents().is_empty())
        });
        if orphaned {
            self.cleanup_subtree(subject);
        }
    }

    fn add_collection_element(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        index: usize,
        item: BrowseItem,
        planned: &mut Vec<PlannedItem>,
    ) {
        if self.skip_recently_deleted(&item.node_id) {
            return;
        }
        // The container type is validated before any subject exists, so
        // an invalid element cannot leave an orphan behind.
        if item.node_class != NodeClass::Object {
            warn!(
                node = %item.node_id,
                "collection element is not an object, skipping"
            );
            return;
        }
        let position = self
            .local_collection(property)
            .iter()
            .filter(|(existing, _)| *existing < index)
            .count();
        let child = self.graph.create_subject(item.browse_name.clone());
        self.graph.with(|graph| {
            graph.enter_remote_change();
            graph.collection_insert(property, position, child);
            graph.exit_remote_change();
        });
        if let Err(status) =
            self.loader.load(session, child, &item.node_id, planned)
        {
            debug!(node = %item.node_id, %status, "loading element failed");
        }
    }

    fn reconcile_dictionary(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        name: &str,
        planned: &mut Vec<PlannedItem>,
    ) {
        let property = PropertyRef::property(subject, name);
        let Some(parent_node) = self.registry.get_external_id(subject)
        else {
            return;
        };
        let Ok(children) = session.browse(&parent_node) else {
            return;
        };
        let Some(container) = children.into_iter().find(|item| {
            item.browse_name == name && item.node_class == NodeClass::Object
        }) else {
            return;
        };
        self.loader.claim_with_node(&property, &container.node_id);

        let Ok(entries) = session.browse(&container.node_id) else {
            return;
        };
        let remote: Vec<BrowseItem> = entries
            .into_iter()
            .filter(|item| item.node_class == NodeClass::Object)
            .collect();
        let remote_keys: HashSet<&str> = remote
            .iter()
            .map(|item| item.browse_name.as_str())
            .collect();
        let local = self
            .graph
            .with(|graph| graph.dictionary_items(&property))
            .unwrap_or_default();

        for (key, subject_id) in &local {
            if !remote_keys.contains(key.as_str()) {
                self.graph.with(|graph| {
                    graph.enter_remote_change();
                    graph.dictionary_remove(&property, key);
                    graph.exit_remote_change();
                });
                self.cleanup_if_orphaned(*subject_id);
            }
        }

        let local_keys: HashSet<&str> =
            local.iter().map(|(key, _)| key.as_str()).collect();
        for item in remote {
            if local_keys.contains(item.browse_name.as_str()) {
                continue;
            }
            if self.skip_recently_deleted(&item.node_id) {
                continue;
            }
            let child = self.graph.create_subject(item.browse_name.clone());
            self.graph.with(|graph| {
                graph.enter_remote_change();
                graph.dictionary_insert(
                    &property,
                    item.browse_name.clone(),
                    child,
                );
                graph.exit_remote_change();
            });
            if let Err(status) =
                self.loader.load(session, child, &item.node_id, planned)
            {
                debug!(node = %item.node_id, %status, "loading entry failed");
            }
        }
    }

    fn skip_recently_deleted(&self, node_id: &NodeId) -> bool {
        if self.publishing_enabled
            && self.registry.was_recently_deleted(node_id)
        {
            debug!(
                node = %node_id,
                "ignoring re-add of a recently deleted node"
            );
            return true;
        }
        false
    }
}
