//! Shared ownership and mutation of a subject graph.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::warn;

use crate::graph::subject::{
    DataEntry, ParentLink, Property, PropertyKind, PropertyRef,
    PropertyValue, Subject, SubjectId,
};
use crate::graph::value::Value;

/// Identity of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u32);

/// A property change a source must propagate outward.
#[derive(Debug, Clone)]
pub struct WriteChange {
    pub property: PropertyRef,
    pub value: Value,
    pub changed_at: SystemTime,
}

/// A structural change made by local code, reported to sources that
/// publish graph changes.
#[derive(Debug, Clone)]
pub enum StructuralChange {
    Attached {
        parent: SubjectId,
        property: String,
        child: SubjectId,
    },
    Detached {
        parent: SubjectId,
        property: String,
        child: SubjectId,
    },
}

struct Inner {
    subjects: HashMap<SubjectId, Subject>,
    next_subject: u64,
    next_source: u32,
    write_taps: HashMap<SourceId, mpsc::Sender<WriteChange>>,
    structural_tap: Option<mpsc::Sender<StructuralChange>>,
    /// When non-zero, structural mutations are source-originated and are
    /// not reported through the structural tap.
    remote_depth: u32,
}

/// Handle to a graph shared between the runtime's threads.
///
/// All operations take the single graph lock for the duration of one
/// mutation; compound operations go through [`GraphStore::with`].
#[derive(Clone)]
pub struct GraphStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for GraphStore {
    fn default() -> Self {
        GraphStore::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        GraphStore {
            inner: Arc::new(Mutex::new(Inner {
                subjects: HashMap::new(),
                next_subject: 0,
                next_source: 0,
                write_taps: HashMap::new(),
                structural_tap: None,
                remote_depth: 0,
            })),
        }
    }

    /// Register a source and the channel its outbound changes go to.
    pub fn register_source(
        &self,
        tap: mpsc::Sender<WriteChange>,
    ) -> SourceId {
        let mut inner = self.inner.lock().unwrap();
        let id = SourceId(inner.next_source);
        inner.next_source += 1;
        inner.write_taps.insert(id, tap);
        id
    }

    /// Install the channel structural changes made by local code are
    /// reported to.
    pub fn set_structural_tap(&self, tap: mpsc::Sender<StructuralChange>) {
        self.inner.lock().unwrap().structural_tap = Some(tap);
    }

    /// Run `f` with the graph locked, for compound reads and mutations.
    pub fn with<R>(&self, f: impl FnOnce(&mut Graph<'_>) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut Graph { inner: &mut inner })
    }

    pub fn create_subject(&self, name: impl Into<String>) -> SubjectId {
        self.with(|graph| graph.create_subject(name))
    }

    pub fn define_property(&self, subject: SubjectId, property: Property) {
        self.with(|graph| graph.define_property(subject, property));
    }

    pub fn value(&self, property: &PropertyRef) -> Option<Value> {
        self.with(|graph| {
            graph.property(property).and_then(|p| match &p.value {
                PropertyValue::Scalar(value) => Some(value.clone()),
                _ => None,
            })
        })
    }

    /// Apply a value on behalf of `source` without echoing the change
    /// back to it.
    pub fn set_value_from_source(
        &self,
        source: SourceId,
        property: &PropertyRef,
        value: Value,
        _source_timestamp: Option<SystemTime>,
        _received_at: SystemTime,
    ) -> Result<(), &'static str> {
        self.with(|graph| {
            graph.set_value_inner(property, value, Some(source))
        })
    }

    /// Apply a locally-originated value; the owning source is notified.
    pub fn set_value(
        &self,
        property: &PropertyRef,
        value: Value,
    ) -> Result<(), &'static str> {
        self.with(|graph| graph.set_value_inner(property, value, None))
    }

    pub fn claim(&self, source: SourceId, property: &PropertyRef) -> bool {
        self.with(|graph| graph.claim(source, property))
    }

    pub fn release(&self, source: SourceId, property: &PropertyRef) {
        self.with(|graph| graph.release(source, property));
    }
}

/// Exclusive view of the graph held for one compound operation.
pub struct Graph<'a> {
    inner: &'a mut Inner,
}

impl Graph<'_> {
    pub fn create_subject(&mut self, name: impl Into<String>) -> SubjectId {
        let id = SubjectId(self.inner.next_subject);
        self.inner.next_subject += 1;
        self.inner.subjects.insert(
            id,
            Subject {
                id,
                name: name.into(),
                properties: Vec::new(),
                parents: Vec::new(),
            },
        );
        id
    }

    pub fn subject(&self, id: SubjectId) -> Option<&Subject> {
        self.inner.subjects.get(&id)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.inner.subjects.values()
    }

    pub fn define_property(&mut self, subject: SubjectId, property: Property) {
        let Some(entry) = self.inner.subjects.get_mut(&subject) else {
            return;
        };
        if entry.property(&property.name).is_none() {
            entry.properties.push(property);
        }
    }

    /// Add a dynamic scalar property discovered at runtime.
    pub fn add_dynamic_property(
        &mut self,
        subject: SubjectId,
        mut property: Property,
    ) {
        property.dynamic = true;
        self.define_property(subject, property);
    }

    /// Add a dynamic attribute under an existing slot.
    pub fn add_dynamic_attribute(
        &mut self,
        parent: &PropertyRef,
        mut attribute: Property,
    ) {
        attribute.dynamic = true;
        let Some(slot) = self.property_mut(parent) else {
            return;
        };
        if slot.find_attribute(&attribute.name).is_none() {
            slot.attributes.push(attribute);
        }
    }

    pub fn property(&self, property: &PropertyRef) -> Option<&Property> {
        let subject = self.inner.subjects.get(&property.subject)?;
        let mut slot = subject.property(property.path.first()?)?;
        for segment in &property.path[1..] {
            slot = slot.find_attribute(segment)?;
        }
        Some(slot)
    }

    pub fn property_mut(
        &mut self,
        property: &PropertyRef,
    ) -> Option<&mut Property> {
        let subject = self.inner.subjects.get_mut(&property.subject)?;
        let mut slot = subject.property_mut(property.path.first()?)?;
        for segment in &property.path[1..] {
            slot = slot.find_attribute_mut(segment)?;
        }
        Some(slot)
    }

    fn set_value_inner(
        &mut self,
        property: &PropertyRef,
        value: Value,
        from: Option<SourceId>,
    ) -> Result<(), &'static str> {
        let Some(slot) = self.property_mut(property) else {
            return Err("no such property");
        };
        match &mut slot.value {
            PropertyValue::Scalar(current) => *current = value.clone(),
            _ => return Err("not a scalar property"),
        }
        let owner = slot.owner;
        if let Some(owner) = owner {
            if from != Some(owner) {
                if let Some(tap) = self.inner.write_taps.get(&owner) {
                    let _ = tap.send(WriteChange {
                        property: property.clone(),
                        value,
                        changed_at: SystemTime::now(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Claim source ownership. Returns false without mutating if another
    /// source already owns the slot.
    pub fn claim(&mut self, source: SourceId, property: &PropertyRef) -> bool {
        let Some(slot) = self.property_mut(property) else {
            return false;
        };
        match slot.owner {
            None => {
                slot.owner = Some(source);
                true
            }
            Some(current) if current == source => true,
            Some(current) => {
                warn!(
                    property = %property,
                    owner = ?current,
                    "property already claimed by another source"
                );
                false
            }
        }
    }

    pub fn release(&mut self, source: SourceId, property: &PropertyRef) {
        if let Some(slot) = self.property_mut(property) {
            if slot.owner == Some(source) {
                slot.owner = None;
            }
        }
    }

    pub fn set_data(
        &mut self,
        property: &PropertyRef,
        key: impl Into<String>,
        entry: DataEntry,
    ) {
        if let Some(slot) = self.property_mut(property) {
            slot.data.insert(key.into(), entry);
        }
    }

    pub fn remove_data(&mut self, property: &PropertyRef, key: &str) {
        if let Some(slot) = self.property_mut(property) {
            slot.data.remove(key);
        }
    }

    /// Strip every data entry whose key starts with `prefix`, across the
    /// whole graph. Used by a source on teardown.
    pub fn clear_data_with_prefix(&mut self, prefix: &str) {
        fn strip(property: &mut Property, prefix: &str) {
            property.data.retain(|key, _| !key.starts_with(prefix));
            for attribute in &mut property.attributes {
                strip(attribute, prefix);
            }
        }
        for subject in self.inner.subjects.values_mut() {
            for property in &mut subject.properties {
                strip(property, prefix);
            }
        }
    }

    /// Release every claim held by `source`, across the whole graph.
    pub fn release_all(&mut self, source: SourceId) {
        fn release(property: &mut Property, source: SourceId) {
            if property.owner == Some(source) {
                property.owner = None;
            }
            for attribute in &mut property.attributes {
                release(attribute, source);
            }
        }
        for subject in self.inner.subjects.values_mut() {
            for property in &mut subject.properties {
                release(property, source);
            }
        }
    }

    /// Enter a window in which structural mutations are source-originated
    /// and must not be reported back through the structural tap.
    pub fn enter_remote_change(&mut self) {
        self.inner.remote_depth += 1;
    }

    pub fn exit_remote_change(&mut self) {
        self.inner.remote_depth = self.inner.remote_depth.saturating_sub(1);
    }

    fn report_structural(&mut self, change: StructuralChange) {
        if self.inner.remote_depth > 0 {
            return;
        }
        if let Some(tap) = &self.inner.structural_tap {
            let _ = tap.send(change);
        }
    }

    fn link_parent(&mut self, child: SubjectId, parent: ParentLink) {
        if let Some(subject) = self.inner.subjects.get_mut(&child) {
            if !subject.parents.contains(&parent) {
                subject.parents.push(parent);
            }
        }
    }

    fn unlink_parent(&mut self, child: SubjectId, parent: &ParentLink) {
        if let Some(subject) = self.inner.subjects.get_mut(&child) {
            subject.parents.retain(|link| link != parent);
        }
    }

    /// Point a reference property at `child`, detaching any previous
    /// child. Returns the previous child.
    pub fn set_reference(
        &mut self,
        property: &PropertyRef,
        child: Option<SubjectId>,
    ) -> Option<SubjectId> {
        let link = ParentLink {
            subject: property.subject,
            property: property.path.first()?.clone(),
        };
        let slot = self.property_mut(property)?;
        let PropertyValue::Reference(current) = &mut slot.value else {
            return None;
        };
        let previous = std::mem::replace(current, child);
        if previous == child {
            return previous;
        }
        if let Some(previous) = previous {
            self.unlink_parent(previous, &link);
            self.report_structural(StructuralChange::Detached {
                parent: property.subject,
                property: link.property.clone(),
                child: previous,
            });
        }
        if let Some(child) = child {
            self.link_parent(child, link.clone());
            self.report_structural(StructuralChange::Attached {
                parent: property.subject,
                property: link.property,
                child,
            });
        }
        previous
    }

    pub fn collection_items(
        &self,
        property: &PropertyRef,
    ) -> Option<Vec<SubjectId>> {
        match &self.property(property)?.value {
            PropertyValue::Collection(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Insert `child` into a collection at `index` (clamped to the end).
    pub fn collection_insert(
        &mut self,
        property: &PropertyRef,
        index: usize,
        child: SubjectId,
    ) -> bool {
        let Some(name) = property.path.first().cloned() else {
            return false;
        };
        let Some(slot) = self.property_mut(property) else {
            return false;
        };
        let PropertyValue::Collection(items) = &mut slot.value else {
            return false;
        };
        let index = index.min(items.len());
        items.insert(index, child);
        let link = ParentLink {
            subject: property.subject,
            property: name.clone(),
        };
        self.link_parent(child, link);
        self.report_structural(StructuralChange::Attached {
            parent: property.subject,
            property: name,
            child,
        });
        true
    }

    /// Remove `child` from a collection, keeping other elements in
    /// order.
    pub fn collection_remove(
        &mut self,
        property: &PropertyRef,
        child: SubjectId,
    ) -> bool {
        let Some(name) = property.path.first().cloned() else {
            return false;
        };
        let Some(slot) = self.property_mut(property) else {
            return false;
        };
        let PropertyValue::Collection(items) = &mut slot.value else {
            return false;
        };
        let Some(position) = items.iter().position(|id| *id == child) else {
            return false;
        };
        items.remove(position);
        let still_held = items.contains(&child);
        let link = ParentLink {
            subject: property.subject,
            property: name.clone(),
        };
        if !still_held {
            self.unlink_parent(child, &link);
        }
        self.report_structural(StructuralChange::Detached {
            parent: property.subject,
            property: name,
            child,
        });
        true
    }

    pub fn dictionary_items(
        &self,
        property: &PropertyRef,
    ) -> Option<Vec<(String, SubjectId)>> {
        match &self.property(property)?.value {
            PropertyValue::Dictionary(items) => Some(
                items
                    .iter()
                    .map(|(key, id)| (key.clone(), *id))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn dictionary_insert(
        &mut self,
        property: &PropertyRef,
        key: impl Into<String>,
        child: SubjectId,
    ) -> bool {
        let Some(name) = property.path.first().cloned() else {
            return false;
        };
        let key = key.into();
        let Some(slot) = self.property_mut(property) else {
            return false;
        };
        let PropertyValue::Dictionary(items) = &mut slot.value else {
            return false;
        };
        let previous = items.insert(key, child);
        let link = ParentLink {
            subject: property.subject,
            property: name.clone(),
        };
        if let Some(previous) = previous {
            if previous != child && !items.values().any(|id| *id == previous)
            {
                self.unlink_parent(previous, &link);
                self.report_structural(StructuralChange::Detached {
                    parent: property.subject,
                    property: name.clone(),
                    child: previous,
                });
            }
        }
        self.link_parent(child, link);
        self.report_structural(StructuralChange::Attached {
            parent: property.subject,
            property: name,
            child,
        });
        true
    }

    pub fn dictionary_remove(
        &mut self,
        property: &PropertyRef,
        key: &str,
    ) -> Option<SubjectId> {
        let name = property.path.first().cloned()?;
        let slot = self.property_mut(property)?;
        let PropertyValue::Dictionary(items) = &mut slot.value else {
            return None;
        };
        let child = items.remove(key)?;
        let still_held = items.values().any(|id| *id == child);
        let link = ParentLink {
            subject: property.subject,
            property: name.clone(),
        };
        if !still_held {
            self.unlink_parent(child, &link);
        }
        self.report_structural(StructuralChange::Detached {
            parent: property.subject,
            property: name,
            child,
        });
        Some(child)
    }

    /// Detach `subject` from every structural slot holding it, then drop
    /// it from the graph.
    pub fn remove_subject(&mut self, subject: SubjectId) {
        let parents = match self.inner.subjects.get(&subject) {
            Some(entry) => entry.parents.clone(),
            None => return,
        };
        for parent in parents {
            let property =
                PropertyRef::property(parent.subject, parent.property);
            let kind = self
                .property(&property)
                .map(|slot| slot.kind.clone());
            match kind {
                Some(PropertyKind::Reference) => {
                    self.set_reference(&property, None);
                }
                Some(PropertyKind::Collection) => {
                    while self.collection_remove(&property, subject) {}
                }
                Some(PropertyKind::Dictionary) => {
                    let keys: Vec<String> = self
                        .dictionary_items(&property)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|(_, id)| *id == subject)
                        .map(|(key, _)| key)
                        .collect();
                    for key in keys {
                        self.dictionary_remove(&property, &key);
                    }
                }
                _ => {}
            }
        }
        self.inner.subjects.remove(&subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::value::ScalarType;

    fn store_with_tap() -> (GraphStore, SourceId, mpsc::Receiver<WriteChange>)
    {
        let store = GraphStore::new();
        let (tx, rx) = mpsc::channel();
        let source = store.register_source(tx);
        (store, source, rx)
    }

    #[test]
    fn local_set_notifies_owner() {
        let (store, source, rx) = store_with_tap();
        let subject = store.create_subject("Motor");
        store.define_property(
            subject,
            Property::scalar("Speed", ScalarType::Double).writable(),
        );
        let speed = PropertyRef::property(subject, "Speed");
        assert!(store.claim(source, &speed));

        store.set_value(&speed, Value::Float(42.0)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.property, speed);
        assert_eq!(change.value, Value::Float(42.0));
    }

    #[test]
    fn source_set_does_not_echo() {
        let (store, source, rx) = store_with_tap();
        let subject = store.create_subject("Motor");
        store.define_property(
            subject,
            Property::scalar("Speed", ScalarType::Double),
        );
        let speed = PropertyRef::property(subject, "Speed");
        assert!(store.claim(source, &speed));

        store
            .set_value_from_source(
                source,
                &speed,
                Value::Float(1.0),
                None,
                SystemTime::now(),
            )
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.value(&speed), Some(Value::Float(1.0)));
    }

    #[test]
    fn duplicate_claim_fails_without_mutating() {
        let (store, source, _rx) = store_with_tap();
        let (tx, _rx2) = mpsc::channel();
        let other = store.register_source(tx);
        let subject = store.create_subject("Motor");
        store.define_property(
            subject,
            Property::scalar("Speed", ScalarType::Double),
        );
        let speed = PropertyRef::property(subject, "Speed");

        assert!(store.claim(source, &speed));
        assert!(!store.claim(other, &speed));
        store.with(|graph| {
            assert_eq!(graph.property(&speed).unwrap().owner(), Some(source));
        });
    }

    #[test]
    fn remove_subject_detaches_from_every_parent() {
        let store = GraphStore::new();
        let (parent_a, parent_b, child) = store.with(|graph| {
            let parent_a = graph.create_subject("A");
            let parent_b = graph.create_subject("B");
            let child = graph.create_subject("C");
            graph.define_property(parent_a, Property::reference("Child"));
            graph.define_property(parent_b, Property::collection("Items"));
            graph.set_reference(
                &PropertyRef::property(parent_a, "Child"),
                Some(child),
            );
            graph.collection_insert(
                &PropertyRef::property(parent_b, "Items"),
                0,
                child,
            );
            (parent_a, parent_b, child)
        });

        store.with(|graph| {
            assert_eq!(graph.subject(child).unwrap().parents().len(), 2);
            graph.remove_subject(child);
            assert!(graph.subject(child).is_none());
            let reference =
                graph.property(&PropertyRef::property(parent_a, "Child"));
            assert_eq!(
                reference.unwrap().value(),
                &PropertyValue::Reference(None)
            );
            let items = graph
                .collection_items(&PropertyRef::property(parent_b, "Items"))
                .unwrap();
            assert!(items.is_empty());
        });
    }

    #[test]
    fn remote_change_window_mutes_structural_tap() {
        let store = GraphStore::new();
        let (tx, rx) = mpsc::channel();
        store.set_structural_tap(tx);
        store.with(|graph| {
            let parent = graph.create_subject("A");
            let child = graph.create_subject("C");
            graph.define_property(parent, Property::reference("Child"));
            graph.enter_remote_change();
            graph.set_reference(
                &PropertyRef::property(parent, "Child"),
                Some(child),
            );
            graph.exit_remote_change();
            graph.set_reference(
                &PropertyRef::property(parent, "Child"),
                None,
            );
        });
        // Only the local detach is reported.
        match rx.try_recv().unwrap() {
            StructuralChange::Detached { property, .. } => {
                assert_eq!(property, "Child");
            }
            change => panic!("unexpected change: {:?}", change),
        }
        assert!(rx.try_recv().is_err());
    }
}
