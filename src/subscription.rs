//! Ownership of the OPC UA subscriptions and their monitored items.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::graph::updater::{UpdateSender, ValueUpdate};
use crate::graph::{PropertyRef, ScalarType};
use crate::polling::{PollItem, PollingManager};
use crate::session::SessionRef;
use crate::ua::{
    ClientHandle, DataChangeHandler, ItemStatus, MonitoredItemRequest,
    NodeId, Notification, StatusCode, SubscriptionOptions, UaSubscription,
};

/// Settings shared by every subscription this manager creates.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub max_items_per_subscription: usize,
    pub options: SubscriptionOptions,
}

/// A monitored item waiting to be placed in a subscription.
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub property: PropertyRef,
    pub scalar: ScalarType,
    pub request: MonitoredItemRequest,
}

/// What to do with an unhealthy monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    /// The node refuses subscriptions; read it by polling instead.
    PollingFallback,
    /// Retrying can never succeed.
    Permanent,
    /// The server may recover; the item stays in the subscription.
    KeepAndRetry,
    /// Remove now, retry through the health sweep.
    Transient,
}

fn classify(status: StatusCode) -> FailureClass {
    match status {
        StatusCode::BadNotSupported
        | StatusCode::BadMonitoredItemFilterUnsupported => {
            FailureClass::PollingFallback
        }
        StatusCode::BadNodeIdUnknown
        | StatusCode::BadAttributeIdInvalid
        | StatusCode::BadIndexRangeInvalid => FailureClass::Permanent,
        StatusCode::BadTooManyMonitoredItems
        | StatusCode::BadOutOfService => FailureClass::KeepAndRetry,
        _ => FailureClass::Transient,
    }
}

struct ItemBinding {
    property: PropertyRef,
    scalar: ScalarType,
    request: MonitoredItemRequest,
}

struct Inner {
    /// Only fully-initialised subscriptions are ever pushed here, so
    /// concurrent readers never observe one under construction.
    subscriptions: Mutex<Vec<Arc<dyn UaSubscription>>>,
    items: Mutex<HashMap<ClientHandle, ItemBinding>>,
    /// Items evicted on a transient failure, waiting for the health
    /// sweep to replace them.
    parked: Mutex<Vec<PlannedItem>>,
    /// Nodes whose zero sampling interval the server revised upward;
    /// the write pipeline reads them back after a write.
    revised: Mutex<HashSet<NodeId>>,
    shutting_down: AtomicBool,
    /// Serialises apply-changes across this manager and the health
    /// sweep.
    apply_gate: Mutex<()>,
    updates: UpdateSender,
    polling: Arc<PollingManager>,
    config: SubscriptionConfig,
}

/// Batches monitored items into subscriptions and routes their
/// notifications into the updater.
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(
        updates: UpdateSender,
        polling: Arc<PollingManager>,
        config: SubscriptionConfig,
    ) -> Self {
        SubscriptionManager {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Vec::new()),
                items: Mutex::new(HashMap::new()),
                parked: Mutex::new(Vec::new()),
                revised: Mutex::new(HashSet::new()),
                shutting_down: AtomicBool::new(false),
                apply_gate: Mutex::new(()),
                updates,
                polling,
                config,
            }),
        }
    }

    /// Create `⌈N/max⌉` subscriptions covering `planned`. Each
    /// subscription is fully initialised and applied before it becomes
    /// visible to anyone else.
    pub fn create_all(
        &self,
        session: &Arc<SessionRef>,
        planned: Vec<PlannedItem>,
    ) -> Result<(), StatusCode> {
        let max = self.inner.config.max_items_per_subscription.max(1);
        for chunk in planned.chunks(max) {
            self.inner.create_one(session, chunk)?;
        }
        Ok(())
    }

    /// Place late-discovered items into an existing subscription with
    /// room, or a new one.
    pub fn add_items(
        &self,
        session: &Arc<SessionRef>,
        planned: Vec<PlannedItem>,
    ) -> Result<(), StatusCode> {
        if planned.is_empty() {
            return Ok(());
        }
        let max = self.inner.config.max_items_per_subscription.max(1);
        let target = {
            let subscriptions = self.inner.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .find(|sub| sub.monitored_item_count() + planned.len() <= max)
                .map(Arc::clone)
        };
        match target {
            Some(subscription) => {
                self.inner.stage(&subscription, &planned);
                {
                    let _gate = self.inner.apply_gate.lock().unwrap();
                    subscription.apply_changes()?;
                }
                self.inner.filter_failed(&subscription);
                Ok(())
            }
            None => self.create_all(session, planned),
        }
    }

    /// Re-apply every subscription and evict newly-failed items. Run by
    /// the health monitor; also replaces items parked on transient
    /// failures.
    pub fn heal(&self, session: Option<&Arc<SessionRef>>) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let subscriptions = self.inner.snapshot();
        for subscription in &subscriptions {
            {
                let _gate = self.inner.apply_gate.lock().unwrap();
                if let Err(status) = subscription.apply_changes() {
                    debug!(%status, "health re-apply failed");
                    continue;
                }
            }
            self.inner.filter_failed(subscription);
        }
        if let Some(session) = session {
            let parked: Vec<PlannedItem> =
                self.inner.parked.lock().unwrap().drain(..).collect();
            if !parked.is_empty() {
                info!(count = parked.len(), "retrying parked items");
                if let Err(status) = self.add_items(session, parked) {
                    debug!(%status, "retrying parked items failed");
                }
            }
        }
    }

    /// Adopt the subscriptions owned by `session` after a transfer,
    /// re-binding the data-change callback on each.
    pub fn adopt(&self, session: &Arc<SessionRef>) {
        let _gate = self.inner.apply_gate.lock().unwrap();
        let transferred = session.subscriptions();
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        subscriptions.clear();
        for subscription in transferred {
            // Remove-then-add keeps the rebind idempotent.
            subscription.set_data_change_handler(None);
            subscription
                .set_data_change_handler(Some(self.inner.handler()));
            subscriptions.push(subscription);
        }
        info!(count = subscriptions.len(), "adopted subscriptions");
    }

    /// Nodes whose `SamplingInterval = 0` request was revised upward.
    pub fn revised_sampling_nodes(&self) -> HashSet<NodeId> {
        self.inner.revised.lock().unwrap().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().unwrap().len()
    }

    pub fn monitored_item_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|sub| sub.monitored_item_count())
            .sum()
    }

    /// Stop monitoring a node, wherever its item lives. Used when the
    /// subject owning the property goes away.
    pub fn remove_node(&self, node_id: &NodeId) {
        let handles: Vec<ClientHandle> = {
            let items = self.inner.items.lock().unwrap();
            items
                .iter()
                .filter(|(_, binding)| binding.request.node_id == *node_id)
                .map(|(handle, _)| *handle)
                .collect()
        };
        self.inner
            .parked
            .lock()
            .unwrap()
            .retain(|item| item.request.node_id != *node_id);
        if handles.is_empty() {
            return;
        }
        let subscriptions = self.inner.snapshot();
        {
            let mut items = self.inner.items.lock().unwrap();
            for handle in &handles {
                items.remove(handle);
            }
        }
        for subscription in &subscriptions {
            for handle in &handles {
                subscription.remove_item(*handle);
            }
        }
        let _gate = self.inner.apply_gate.lock().unwrap();
        for subscription in &subscriptions {
            if let Err(status) = subscription.apply_changes() {
                debug!(%status, "apply after node removal failed");
            }
        }
    }

    /// Forget every subscription and binding without shutting down, so a
    /// recreated session can start from scratch.
    pub fn reset(&self) {
        let _gate = self.inner.apply_gate.lock().unwrap();
        self.inner.subscriptions.lock().unwrap().clear();
        self.inner.items.lock().unwrap().clear();
        self.inner.parked.lock().unwrap().clear();
        self.inner.revised.lock().unwrap().clear();
    }

    /// Delete every subscription. Idempotent; notifications arriving
    /// afterwards are discarded.
    pub fn dispose(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let _gate = self.inner.apply_gate.lock().unwrap();
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        for subscription in subscriptions.drain(..) {
            subscription.set_data_change_handler(None);
            if let Err(status) = subscription.delete() {
                debug!(%status, "deleting subscription failed");
            }
        }
        self.inner.items.lock().unwrap().clear();
        self.inner.parked.lock().unwrap().clear();
    }
}

impl Inner {
    fn snapshot(&self) -> Vec<Arc<dyn UaSubscription>> {
        self.subscriptions.lock().unwrap().clone()
    }

    fn handler(self: &Arc<Self>) -> DataChangeHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |notifications: &[Notification]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_data_change(notifications);
            }
        })
    }

    fn create_one(
        self: &Arc<Self>,
        session: &Arc<SessionRef>,
        planned: &[PlannedItem],
    ) -> Result<(), StatusCode> {
        let subscription = session.create_subscription(&self.config.options)?;
        subscription.set_data_change_handler(Some(self.handler()));
        self.stage(&subscription, planned);
        {
            let _gate = self.apply_gate.lock().unwrap();
            subscription.apply_changes()?;
        }
        self.filter_failed(&subscription);
        // Published last: the health sweep never sees a subscription
        // that is still being set up.
        self.subscriptions.lock().unwrap().push(subscription);
        Ok(())
    }

    fn stage(
        &self,
        subscription: &Arc<dyn UaSubscription>,
        planned: &[PlannedItem],
    ) {
        let mut items = self.items.lock().unwrap();
        for item in planned {
            let handle = subscription.add_item(item.request.clone());
            items.insert(
                handle,
                ItemBinding {
                    property: item.property.clone(),
                    scalar: item.scalar.clone(),
                    request: item.request.clone(),
                },
            );
        }
    }

    /// Fast data-change path, invoked on transport threads.
    fn on_data_change(self: &Arc<Self>, notifications: &[Notification]) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let updates = self.updates.clone();
        let mut buffer = scopeguard::guard(updates.rent(), {
            let updates = updates.clone();
            move |buffer| updates.give(buffer)
        });
        {
            let items = self.items.lock().unwrap();
            for notification in notifications {
                let Some(binding) = items.get(&notification.client_handle)
                else {
                    continue;
                };
                if !notification.value.status.is_good() {
                    debug!(
                        node = %binding.request.node_id,
                        status = %notification.value.status,
                        "notification with bad status"
                    );
                    continue;
                }
                buffer.push(ValueUpdate {
                    property: binding.property.clone(),
                    value: crate::convert::from_wire(
                        &notification.value.value,
                        &binding.scalar,
                    ),
                    source_timestamp: notification.value.source_timestamp,
                    received_at: SystemTime::now(),
                });
            }
        }
        // The updater returns the buffer to the pool after applying it;
        // an empty buffer goes straight back.
        updates.enqueue(scopeguard::ScopeGuard::into_inner(buffer));
    }

    /// Evict unhealthy items according to their failure class.
    fn filter_failed(self: &Arc<Self>, subscription: &Arc<dyn UaSubscription>) {
        let statuses: Vec<ItemStatus> = subscription.item_statuses();
        let mut removed_any = false;
        for status in statuses {
            if status.created && !status.status.is_bad() {
                self.note_revised_sampling(&status);
                continue;
            }
            let class = classify(status.status);
            match class {
                FailureClass::KeepAndRetry => {
                    debug!(
                        node = %status.node_id,
                        status = %status.status,
                        "leaving item for the server to recover"
                    );
                    continue;
                }
                FailureClass::PollingFallback => {
                    let binding = self.unbind(subscription, &status);
                    removed_any = true;
                    match binding {
                        Some(binding) if self.polling.is_enabled() => {
                            info!(
                                node = %status.node_id,
                                status = %status.status,
                                "moving item to polling"
                            );
                            self.polling.add(PollItem {
                                node_id: binding.request.node_id,
                                property: binding.property,
                                scalar: binding.scalar,
                            });
                        }
                        _ => warn!(
                            node = %status.node_id,
                            status = %status.status,
                            "item cannot be subscribed and polling is off"
                        ),
                    }
                }
                FailureClass::Permanent => {
                    self.unbind(subscription, &status);
                    removed_any = true;
                    warn!(
                        node = %status.node_id,
                        status = %status.status,
                        "dropping unmonitorable item"
                    );
                }
                FailureClass::Transient => {
                    if let Some(binding) = self.unbind(subscription, &status)
                    {
                        self.parked.lock().unwrap().push(PlannedItem {
                            property: binding.property,
                            scalar: binding.scalar,
                            request: binding.request,
                        });
                    }
                    removed_any = true;
                    debug!(
                        node = %status.node_id,
                        status = %status.status,
                        "parking item after transient failure"
                    );
                }
            }
        }
        if removed_any {
            let _gate = self.apply_gate.lock().unwrap();
            if let Err(status) = subscription.apply_changes() {
                debug!(%status, "apply after item removal failed");
            }
        }
    }

    fn note_revised_sampling(&self, status: &ItemStatus) {
        let requested_zero = self
            .items
            .lock()
            .unwrap()
            .get(&status.client_handle)
            .is_some_and(|binding| {
                binding.request.sampling_interval.is_zero()
            });
        if requested_zero && !status.revised_sampling_interval.is_zero() {
            self.revised
                .lock()
                .unwrap()
                .insert(status.node_id.clone());
        }
    }

    fn unbind(
        &self,
        subscription: &Arc<dyn UaSubscription>,
        status: &ItemStatus,
    ) -> Option<ItemBinding> {
        subscription.remove_item(status.client_handle);
        self.items.lock().unwrap().remove(&status.client_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::updater::{BufferPool, SubjectUpdater};
    use crate::graph::{GraphStore, Property, Value};
    use crate::polling::PollingOptions;
    use crate::session::SessionSlot;
    use crate::sim::SimServer;
    use crate::ua::{Connector, EndpointOptions, Variant};
    use std::sync::mpsc;
    use std::time::Duration;

    fn endpoint() -> EndpointOptions {
        EndpointOptions {
            server_url: "opc.tcp://sim".into(),
            application_name: "test".into(),
            session_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
        }
    }

    struct Fixture {
        server: SimServer,
        graph: GraphStore,
        slot: Arc<SessionSlot>,
        polling: Arc<PollingManager>,
        manager: SubscriptionManager,
        _updater: SubjectUpdater,
    }

    fn fixture(max_items: usize) -> Fixture {
        let server = SimServer::new();
        server.add_object(None, NodeId::numeric(0, 85), "Objects");

        let graph = GraphStore::new();
        let (tap, _rx) = mpsc::channel();
        let source = graph.register_source(tap);
        let updater = SubjectUpdater::spawn(
            graph.clone(),
            source,
            Arc::new(BufferPool::new(8)),
        );

        let slot = Arc::new(SessionSlot::new());
        let polling = Arc::new(PollingManager::new(
            Arc::clone(&slot),
            updater.sender(),
            PollingOptions {
                enabled: true,
                interval: Duration::from_millis(100),
                batch_size: 10,
                disposal_timeout: Duration::from_secs(1),
                breaker_threshold: 3,
                breaker_cooldown: Duration::from_secs(30),
            },
        ));
        let manager = SubscriptionManager::new(
            updater.sender(),
            Arc::clone(&polling),
            SubscriptionConfig {
                max_items_per_subscription: max_items,
                options: SubscriptionOptions {
                    publishing_interval: Duration::from_millis(100),
                    keep_alive_count: 10,
                    lifetime_count: 30,
                    priority: 0,
                    max_notifications_per_publish: 0,
                },
            },
        );
        Fixture {
            server,
            graph,
            slot,
            polling,
            manager,
            _updater: updater,
        }
    }

    fn planned_item(
        fixture: &Fixture,
        name: &str,
        value: Variant,
    ) -> (NodeId, PropertyRef, PlannedItem) {
        let node = NodeId::string(2, format!("Plant/{}", name));
        fixture
            .server
            .add_variable(None, node.clone(), name, value);
        let subject = fixture.graph.create_subject(name);
        fixture.graph.define_property(
            subject,
            Property::scalar(name, ScalarType::Double),
        );
        let property = PropertyRef::property(subject, name);
        let planned = PlannedItem {
            property: property.clone(),
            scalar: ScalarType::Double,
            request: MonitoredItemRequest {
                node_id: node.clone(),
                sampling_interval: Duration::from_millis(100),
                queue_size: 1,
                discard_oldest: true,
                filter: None,
            },
        };
        (node, property, planned)
    }

    fn connect(fixture: &Fixture) -> Arc<SessionRef> {
        let session =
            fixture.server.connector().connect(&endpoint()).unwrap();
        fixture.slot.replace(Some(session));
        fixture.slot.load().unwrap()
    }

    fn settle(fixture: &Fixture, property: &PropertyRef, expected: &Value) {
        for _ in 0..100 {
            if fixture.graph.value(property).as_ref() == Some(expected) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!(
            "graph never reached {:?}, last {:?}",
            expected,
            fixture.graph.value(property)
        );
    }

    #[test]
    fn batches_items_into_ceil_n_over_max_subscriptions() {
        let fixture = fixture(2);
        let session = connect(&fixture);
        let mut planned = Vec::new();
        for i in 0..5 {
            let (_, _, item) = planned_item(
                &fixture,
                &format!("Value{}", i),
                Variant::Double(i as f64),
            );
            planned.push(item);
        }
        fixture.manager.create_all(&session, planned).unwrap();
        assert_eq!(fixture.manager.subscription_count(), 3);
        assert_eq!(fixture.manager.monitored_item_count(), 5);
    }

    #[test]
    fn delivers_data_changes_through_the_updater() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, property, planned) =
            planned_item(&fixture, "Speed", Variant::Double(1.0));
        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        // The initial-value notification arrives first.
        settle(&fixture, &property, &Value::Float(1.0));

        fixture.server.set_value(&node, Variant::Double(3.5));
        settle(&fixture, &property, &Value::Float(3.5));
    }

    #[test]
    fn unsupported_items_move_to_polling() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, _, planned) =
            planned_item(&fixture, "Legacy", Variant::Double(1.0));
        fixture
            .server
            .set_monitor_status(&node, StatusCode::BadNotSupported);

        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        assert_eq!(fixture.manager.monitored_item_count(), 0);
        assert_eq!(fixture.polling.len(), 1);
    }

    #[test]
    fn permanent_failures_are_dropped() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (_, _, mut planned) =
            planned_item(&fixture, "Ghost", Variant::Double(1.0));
        planned.request.node_id = NodeId::string(2, "Plant/DoesNotExist");

        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        assert_eq!(fixture.manager.monitored_item_count(), 0);
        assert_eq!(fixture.polling.len(), 0);
        assert!(fixture.manager.inner.parked.lock().unwrap().is_empty());
    }

    #[test]
    fn resource_exhaustion_stays_in_subscription_until_it_heals() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, property, planned) =
            planned_item(&fixture, "Busy", Variant::Double(7.0));
        fixture
            .server
            .set_monitor_status(&node, StatusCode::BadTooManyMonitoredItems);

        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        assert_eq!(fixture.manager.monitored_item_count(), 0);
        assert_eq!(fixture.polling.len(), 0);

        // The server recovers; the health sweep heals the item.
        fixture.server.set_monitor_status(&node, StatusCode::Good);
        fixture.manager.heal(Some(&session));
        assert_eq!(fixture.manager.monitored_item_count(), 1);
        settle(&fixture, &property, &Value::Float(7.0));
    }

    #[test]
    fn transient_failures_are_parked_and_retried() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, property, planned) =
            planned_item(&fixture, "Flaky", Variant::Double(2.0));
        fixture
            .server
            .set_monitor_status(&node, StatusCode::BadInternalError);

        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        assert_eq!(fixture.manager.monitored_item_count(), 0);
        assert_eq!(fixture.manager.inner.parked.lock().unwrap().len(), 1);

        fixture.server.set_monitor_status(&node, StatusCode::Good);
        fixture.manager.heal(Some(&session));
        assert_eq!(fixture.manager.monitored_item_count(), 1);
        settle(&fixture, &property, &Value::Float(2.0));
    }

    #[test]
    fn zero_sampling_revisions_are_recorded() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, _, mut planned) =
            planned_item(&fixture, "Fast", Variant::Double(0.0));
        planned.request.sampling_interval = Duration::ZERO;

        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        assert!(fixture.manager.revised_sampling_nodes().contains(&node));
    }

    #[test]
    fn shutdown_discards_notifications() {
        let fixture = fixture(10);
        let session = connect(&fixture);
        let (node, property, planned) =
            planned_item(&fixture, "Late", Variant::Double(1.0));
        fixture
            .manager
            .create_all(&session, vec![planned])
            .unwrap();
        settle(&fixture, &property, &Value::Float(1.0));

        fixture.manager.dispose();
        fixture.server.set_value(&node, Variant::Double(9.0));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            fixture.graph.value(&property),
            Some(Value::Float(1.0))
        );
    }
}
