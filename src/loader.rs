//! Initial discovery: materialising local subjects from the remote
//! hierarchy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::convert;
use crate::graph::{
    DataEntry, GraphStore, Property, PropertyKind, PropertyRef, ScalarType,
    SourceId, SubjectId,
};
use crate::monitored_item::MonitoredItemFactory;
use crate::polling::PollingManager;
use crate::registry::SubjectRegistry;
use crate::session::SessionRef;
use crate::subscription::{PlannedItem, SubscriptionManager};
use crate::ua::{
    split_indexed_name, BrowseItem, NodeClass, NodeId, StatusCode,
};

/// Property-data key under which this source records the mapped node.
pub(crate) const NODE_DATA_KEY: &str = "opcua.node";

/// Tracks whether a server-originated structural change is being
/// applied. While the window is open, monitored items are not installed:
/// the subscription's initial-value notification would race the explicit
/// read that reconciliation performs. The window nests.
#[derive(Default)]
pub struct RemoteChangeWindow {
    depth: AtomicU32,
}

impl RemoteChangeWindow {
    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    pub fn enter(self: &Arc<Self>) -> RemoteChangeGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        RemoteChangeGuard {
            window: Arc::clone(self),
        }
    }
}

/// RAII guard for one level of the remote-change window.
pub struct RemoteChangeGuard {
    window: Arc<RemoteChangeWindow>,
}

impl Drop for RemoteChangeGuard {
    fn drop(&mut self) {
        self.window.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Policy switches for schema-discovered members.
#[derive(Debug, Clone)]
pub struct LoaderPolicy {
    pub add_dynamic_properties: bool,
    pub add_dynamic_attributes: bool,
}

enum Resolved {
    Scalar(String, ScalarType),
    Reference(String),
    Collection(String),
    Dictionary(String),
    FlatItem(String, usize),
    Unknown,
}

/// Walks the remote hierarchy, creating subjects, claiming property
/// ownership and planning monitored items.
pub struct SubjectLoader {
    graph: GraphStore,
    registry: Arc<SubjectRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    polling: Arc<PollingManager>,
    factory: MonitoredItemFactory,
    policy: LoaderPolicy,
    source: SourceId,
    window: Arc<RemoteChangeWindow>,
    /// Cycle guard across one loader lifetime.
    loaded: Mutex<HashSet<SubjectId>>,
}

impl SubjectLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: GraphStore,
        registry: Arc<SubjectRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        polling: Arc<PollingManager>,
        factory: MonitoredItemFactory,
        policy: LoaderPolicy,
        source: SourceId,
        window: Arc<RemoteChangeWindow>,
    ) -> Self {
        SubjectLoader {
            graph,
            registry,
            subscriptions,
            polling,
            factory,
            policy,
            source,
            window,
            loaded: Mutex::new(HashSet::new()),
        }
    }

    pub fn window(&self) -> &Arc<RemoteChangeWindow> {
        &self.window
    }

    /// Load `subject`'s children from `node_id`, recursively. Planned
    /// monitored items accumulate in `planned`; the caller decides when
    /// they are installed.
    pub fn load(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        node_id: &NodeId,
        planned: &mut Vec<PlannedItem>,
    ) -> Result<(), StatusCode> {
        let first = self.registry.track(subject, node_id.clone());
        if !self.loaded.lock().unwrap().insert(subject) {
            return Ok(());
        }
        if !first {
            // Not the first reference; the subject is already wired.
            return Ok(());
        }

        let children = session.browse(node_id)?;
        let mut matched: HashSet<String> = HashSet::new();
        let mut flat_buckets: HashMap<String, Vec<(usize, BrowseItem)>> =
            HashMap::new();

        for child in children {
            match self.resolve(subject, &child) {
                Resolved::Scalar(name, scalar) => {
                    matched.insert(name.clone());
                    let property = PropertyRef::property(subject, &name);
                    self.adopt_value_property(
                        session, &property, &child, scalar, planned,
                    );
                }
                Resolved::Reference(name) => {
                    matched.insert(name.clone());
                    let property = PropertyRef::property(subject, &name);
                    self.claim_with_node(&property, &child.node_id);
                    let child_subject = self.attach_reference(
                        &property,
                        &child.browse_name,
                    );
                    self.load(
                        session,
                        child_subject,
                        &child.node_id,
                        planned,
                    )?;
                }
                Resolved::Collection(name) => {
                    matched.insert(name.clone());
                    let property = PropertyRef::property(subject, &name);
                    self.claim_with_node(&property, &child.node_id);
                    self.load_container_collection(
                        session, &property, &child, planned,
                    )?;
                }
                Resolved::Dictionary(name) => {
                    matched.insert(name.clone());
                    let property = PropertyRef::property(subject, &name);
                    self.claim_with_node(&property, &child.node_id);
                    self.load_dictionary(session, &property, &child, planned)?;
                }
                Resolved::FlatItem(base, index) => {
                    matched.insert(base.clone());
                    flat_buckets
                        .entry(base)
                        .or_default()
                        .push((index, child));
                }
                Resolved::Unknown => {
                    self.maybe_add_dynamic(session, subject, &child, planned);
                }
            }
        }

        // Flat-layout collections are instantiated in index order once
        // all siblings are known.
        let mut buckets: Vec<(String, Vec<(usize, BrowseItem)>)> =
            flat_buckets.into_iter().collect();
        buckets.sort_by(|a, b| a.0.cmp(&b.0));
        for (base, mut items) in buckets {
            items.sort_by_key(|(index, _)| *index);
            let property = PropertyRef::property(subject, &base);
            self.graph.claim(self.source, &property);
            for (_, item) in items {
                let child_subject =
                    self.graph.create_subject(item.browse_name.clone());
                self.graph.with(|graph| {
                    graph.enter_remote_change();
                    graph.collection_insert(
                        &property,
                        usize::MAX,
                        child_subject,
                    );
                    graph.exit_remote_change();
                });
                self.load(session, child_subject, &item.node_id, planned)?;
            }
        }

        // Structural properties with no server counterpart still get an
        // owner so that locally-created children propagate outward.
        let unmatched: Vec<String> = self.graph.with(|graph| {
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
                            ) && !matched.contains(property.name())
                        })
                        .map(|property| property.name().to_string())
                        .collect()
                })
                .unwrap_or_default()
        });
        for name in unmatched {
            self.graph
                .claim(self.source, &PropertyRef::property(subject, name));
        }

        Ok(())
    }

    /// Create a subject attached through a reference slot.
    pub(crate) fn attach_reference(
        &self,
        property: &PropertyRef,
        name: &str,
    ) -> SubjectId {
        let child = self.graph.create_subject(name);
        self.graph.with(|graph| {
            graph.enter_remote_change();
            graph.set_reference(property, Some(child));
            graph.exit_remote_change();
        });
        child
    }

    /// Rebuild the planned-item list from the graph, for a full
    /// re-subscribe after manual session recovery.
    pub fn replan(&self) -> Vec<PlannedItem> {
        let mut planned = Vec::new();
        self.graph.with(|graph| {
            let subjects: Vec<SubjectId> =
                graph.subjects().map(|subject| subject.id()).collect();
            for subject in subjects {
                let Some(entry) = graph.subject(subject) else {
                    continue;
                };
                for property in entry.properties() {
                    collect_planned(
                        &self.factory,
                        self.source,
                        property,
                        PropertyRef::property(subject, property.name()),
                        &mut planned,
                    );
                }
            }
        });
        planned
    }

    /// Read current values for `planned` and apply them directly. Used
    /// by reconciliation, where the explicit read replaces the initial
    /// notification.
    pub fn read_initial(
        &self,
        session: &Arc<SessionRef>,
        planned: &[PlannedItem],
    ) {
        if planned.is_empty() {
            return;
        }
        let nodes: Vec<NodeId> = planned
            .iter()
            .map(|item| item.request.node_id.clone())
            .collect();
        let results = match session.read(&nodes) {
            Ok(results) => results,
            Err(status) => {
                debug!(%status, "initial read failed");
                return;
            }
        };
        for (item, result) in planned.iter().zip(results) {
            if !result.status.is_good() {
                continue;
            }
            let value = convert::from_wire(&result.value, &item.scalar);
            let _ = self.graph.set_value_from_source(
                self.source,
                &item.property,
                value,
                result.source_timestamp,
                SystemTime::now(),
            );
        }
    }

    /// Install planned items now, unless a server-originated change is
    /// being applied (its follow-up events will carry the values).
    pub fn install(
        &self,
        session: &Arc<SessionRef>,
        planned: Vec<PlannedItem>,
    ) {
        if self.window.is_active() {
            debug!(
                count = planned.len(),
                "deferring monitored items during remote change"
            );
            return;
        }
        if let Err(status) = self.subscriptions.add_items(session, planned) {
            warn!(%status, "installing monitored items failed");
        }
    }

    /// Release everything the source holds for `subject`: monitored
    /// items, polling entries, registry tracking, and the loaded mark.
    pub fn unregister(&self, subject: SubjectId) {
        let nodes = self.mapped_nodes(subject);
        self.registry.purge(subject);
        self.loaded.lock().unwrap().remove(&subject);
        for node in nodes {
            self.subscriptions.remove_node(&node);
            self.polling.remove(&node);
        }
    }

    /// Node ids recorded in the subject's property data bags.
    fn mapped_nodes(&self, subject: SubjectId) -> Vec<NodeId> {
        fn visit(property: &Property, nodes: &mut Vec<NodeId>) {
            if let Some(node) = property.node_id(NODE_DATA_KEY) {
                nodes.push(node.clone());
            }
            for attribute in property.attributes() {
                visit(attribute, nodes);
            }
        }
        self.graph.with(|graph| {
            let mut nodes = Vec::new();
            if let Some(entry) = graph.subject(subject) {
                for property in entry.properties() {
                    visit(property, &mut nodes);
                }
            }
            nodes
        })
    }

    fn resolve(&self, subject: SubjectId, child: &BrowseItem) -> Resolved {
        let declared = self.graph.with(|graph| {
            graph
                .subject(subject)
                .and_then(|entry| entry.property(&child.browse_name))
                .map(|property| property.kind().clone())
        });
        if let Some(kind) = declared {
            return match kind {
                PropertyKind::Scalar(scalar) => {
                    Resolved::Scalar(child.browse_name.clone(), scalar)
                }
                PropertyKind::Reference => {
                    Resolved::Reference(child.browse_name.clone())
                }
                PropertyKind::Collection => {
                    Resolved::Collection(child.browse_name.clone())
                }
                PropertyKind::Dictionary => {
                    Resolved::Dictionary(child.browse_name.clone())
                }
            };
        }
        if let Some((base, index)) = split_indexed_name(&child.browse_name) {
            let flat = self.graph.with(|graph| {
                graph
                    .subject(subject)
                    .and_then(|entry| entry.property(base))
                    .is_some_and(|property| {
                        matches!(property.kind(), PropertyKind::Collection)
                            && property.is_flat_layout()
                    })
            });
            if flat {
                return Resolved::FlatItem(base.to_string(), index);
            }
        }
        Resolved::Unknown
    }

    pub(crate) fn claim_with_node(
        &self,
        property: &PropertyRef,
        node_id: &NodeId,
    ) {
        self.graph.with(|graph| {
            if graph.claim(self.source, property) {
                graph.set_data(
                    property,
                    NODE_DATA_KEY,
                    DataEntry::NodeId(node_id.clone()),
                );
            }
        });
    }

    /// Wire a value node to a scalar slot: record the node, claim
    /// ownership, plan a monitored item, and optionally pick up dynamic
    /// attributes below it.
    fn adopt_value_property(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        child: &BrowseItem,
        scalar: ScalarType,
        planned: &mut Vec<PlannedItem>,
    ) {
        self.claim_with_node(property, &child.node_id);
        planned.push(PlannedItem {
            property: property.clone(),
            scalar,
            request: self.factory.build(&child.node_id),
        });
        if self.policy.add_dynamic_attributes {
            self.discover_attributes(session, property, &child.node_id, planned);
        }
    }

    /// Value nodes may carry attribute variables (engineering unit and
    /// the like) as children; map them as nested slots.
    fn discover_attributes(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        node_id: &NodeId,
        planned: &mut Vec<PlannedItem>,
    ) {
        let children = match session.browse(node_id) {
            Ok(children) => children,
            Err(_) => return,
        };
        for child in children {
            if child.node_class != NodeClass::Variable {
                continue;
            }
            let Some(scalar) = self.infer_type(session, &child.node_id)
            else {
                debug!(node = %child.node_id, "cannot type attribute, skipping");
                continue;
            };
            let attribute = property.attribute(&child.browse_name);
            self.graph.with(|graph| {
                graph.add_dynamic_attribute(
                    property,
                    Property::scalar(&child.browse_name, scalar.clone()),
                );
            });
            self.claim_with_node(&attribute, &child.node_id);
            planned.push(PlannedItem {
                property: attribute,
                scalar,
                request: self.factory.build(&child.node_id),
            });
        }
    }

    fn maybe_add_dynamic(
        &self,
        session: &Arc<SessionRef>,
        subject: SubjectId,
        child: &BrowseItem,
        planned: &mut Vec<PlannedItem>,
    ) {
        if child.node_class != NodeClass::Variable
            || !self.policy.add_dynamic_properties
        {
            return;
        }
        let Some(scalar) = self.infer_type(session, &child.node_id) else {
            debug!(
                node = %child.node_id,
                "cannot infer a type for dynamic property, skipping"
            );
            return;
        };
        self.graph.with(|graph| {
            graph.add_dynamic_property(
                subject,
                Property::scalar(&child.browse_name, scalar.clone())
                    .writable(),
            );
        });
        let property = PropertyRef::property(subject, &child.browse_name);
        self.adopt_value_property(session, &property, child, scalar, planned);
    }

    fn infer_type(
        &self,
        session: &Arc<SessionRef>,
        node_id: &NodeId,
    ) -> Option<ScalarType> {
        let results = session.read(std::slice::from_ref(node_id)).ok()?;
        let result = results.first()?;
        if !result.status.is_good() {
            return None;
        }
        convert::infer_scalar_type(&result.value)
    }

    /// Container-layout collection: the child object holds `Name[i]`
    /// elements.
    fn load_container_collection(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        container: &BrowseItem,
        planned: &mut Vec<PlannedItem>,
    ) -> Result<(), StatusCode> {
        let mut elements: Vec<(usize, BrowseItem)> = session
            .browse(&container.node_id)?
            .into_iter()
            .filter_map(|item| {
                let index = split_indexed_name(&item.browse_name).map(|(_, index)| index);
                index.map(|index| (index, item))
            })
            .collect();
        elements.sort_by_key(|(index, _)| *index);
        for (_, element) in elements {
            if element.node_class != NodeClass::Object {
                warn!(
                    node = %element.node_id,
                    "collection element is not an object, skipping"
                );
                continue;
            }
            let child_subject =
                self.graph.create_subject(element.browse_name.clone());
            self.graph.with(|graph| {
                graph.enter_remote_change();
                graph.collection_insert(property, usize::MAX, child_subject);
                graph.exit_remote_change();
            });
            self.load(session, child_subject, &element.node_id, planned)?;
        }
        Ok(())
    }

    fn load_dictionary(
        &self,
        session: &Arc<SessionRef>,
        property: &PropertyRef,
        container: &BrowseItem,
        planned: &mut Vec<PlannedItem>,
    ) -> Result<(), StatusCode> {
        for element in session.browse(&container.node_id)? {
            if element.node_class != NodeClass::Object {
                continue;
            }
            let child_subject =
                self.graph.create_subject(element.browse_name.clone());
            self.graph.with(|graph| {
                graph.enter_remote_change();
                graph.dictionary_insert(
                    property,
                    element.browse_name.clone(),
                    child_subject,
                );
                graph.exit_remote_change();
            });
            self.load(session, child_subject, &element.node_id, planned)?;
        }
        Ok(())
    }
}

fn collect_planned(
    factory: &MonitoredItemFactory,
    source: SourceId,
    property: &Property,
    property_ref: PropertyRef,
    planned: &mut Vec<PlannedItem>,
) {
    if property.owner() == Some(source) {
        if let (PropertyKind::Scalar(scalar), Some(node_id)) =
            (property.kind(), property.node_id(NODE_DATA_KEY))
        {
            planned.push(PlannedItem {
                property: property_ref.clone(),
                scalar: scalar.clone(),
                request: factory.build(node_id),
            });
        }
    }
    for attribute in property.attributes() {
        collect_planned(
            factory,
            source,
            attribute,
            property_ref.attribute(attribute.name()),
            planned,
        );
    }
}
