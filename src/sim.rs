//! In-process simulation of an OPC UA server.
//!
//! Implements the [`crate::ua`] contract against an in-memory address
//! space, with scripted failures for exercising the runtime's recovery
//! paths: per-node read/write/monitor status codes, connection refusal,
//! session drops, and manually driven reconnects. Backs the
//! demonstration binary and the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::ua::{
    split_indexed_name, BrowseItem, ClientHandle, Connector,
    DataChangeHandler, DataValue, EndpointOptions, ItemStatus, KeepAlive,
    KeepAliveHandler, ModelChangeEvent, ModelChangeHandler, ModelChangeVerb,
    MonitoredItemRequest, NodeClass, NodeId, NodeInfo, Notification,
    ReconnectCallback, ReconnectHandler, ReconnectState, ServerState,
    SessionId, StatusCode, SubscriptionOptions, UaSession, UaSubscription,
    Variant, WriteRequest,
};

struct SimNode {
    browse_name: String,
    node_class: NodeClass,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    value: Variant,
    type_definition: Option<NodeId>,
    read_status: StatusCode,
    write_status: StatusCode,
    monitor_status: StatusCode,
}

struct Space {
    nodes: HashMap<NodeId, SimNode>,
}

struct ServerInner {
    space: Mutex<Space>,
    current: Mutex<Option<Arc<SimSession>>>,
    sessions: Mutex<HashMap<SessionId, Weak<SimSession>>>,
    writes: Mutex<Vec<WriteRequest>>,
    fail_reads: AtomicU32,
    next_session: AtomicU32,
    next_subscription: AtomicU32,
    next_handle: AtomicU32,
    max_nodes_per_write: AtomicU32,
}

/// Handle to the simulated server, shared by sessions and the test or
/// demo driver.
#[derive(Clone)]
pub struct SimServer {
    inner: Arc<ServerInner>,
}

impl Default for SimServer {
    fn default() -> Self {
        SimServer::new()
    }
}

impl SimServer {
    pub fn new() -> Self {
        SimServer {
            inner: Arc::new(ServerInner {
                space: Mutex::new(Space {
                    nodes: HashMap::new(),
                }),
                current: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
                fail_reads: AtomicU32::new(0),
                next_session: AtomicU32::new(1),
                next_subscription: AtomicU32::new(1),
                next_handle: AtomicU32::new(1),
                max_nodes_per_write: AtomicU32::new(0),
            }),
        }
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            server: self.clone(),
            handler: Arc::new(SimReconnectHandler {
                server: self.clone(),
                state: Mutex::new(ReconnectState::Ready),
                pending: Mutex::new(None),
                result: Mutex::new(None),
            }),
            fail_connects: AtomicU32::new(0),
        }
    }

    pub fn set_max_nodes_per_write(&self, limit: usize) {
        self.inner
            .max_nodes_per_write
            .store(limit as u32, Ordering::Relaxed);
    }

    /// Add an object node. Announces a `NodeAdded` event if a session is
    /// listening.
    pub fn add_object(
        &self,
        parent: Option<&NodeId>,
        node_id: NodeId,
        browse_name: impl Into<String>,
    ) {
        self.add_node(parent, node_id, browse_name, NodeClass::Object, None);
    }

    /// Add a variable node holding `value`.
    pub fn add_variable(
        &self,
        parent: Option<&NodeId>,
        node_id: NodeId,
        browse_name: impl Into<String>,
        value: Variant,
    ) {
        self.add_node(
            parent,
            node_id,
            browse_name,
            NodeClass::Variable,
            Some(value),
        );
    }

    fn add_node(
        &self,
        parent: Option<&NodeId>,
        node_id: NodeId,
        browse_name: impl Into<String>,
        node_class: NodeClass,
        value: Option<Variant>,
    ) {
        {
            let mut space = self.inner.space.lock().unwrap();
            space.nodes.insert(
                node_id.clone(),
                SimNode {
                    browse_name: browse_name.into(),
                    node_class,
                    parent: parent.cloned(),
                    children: Vec::new(),
                    value: value.unwrap_or(Variant::Empty),
                    type_definition: None,
                    read_status: StatusCode::Good,
                    write_status: StatusCode::Good,
                    monitor_status: StatusCode::Good,
                },
            );
            if let Some(parent) = parent {
                if let Some(entry) = space.nodes.get_mut(parent) {
                    entry.children.push(node_id.clone());
                }
            }
        }
        self.emit_model_change(ModelChangeVerb::NodeAdded, node_id);
    }

    /// Remove a node and its descendants. Announces `NodeDeleted` for
    /// the removed root.
    pub fn remove_node(&self, node_id: &NodeId) {
        {
            let mut space = self.inner.space.lock().unwrap();
            let mut pending = vec![node_id.clone()];
            while let Some(next) = pending.pop() {
                if let Some(node) = space.nodes.remove(&next) {
                    pending.extend(node.children);
                }
            }
            for node in space.nodes.values_mut() {
                node.children.retain(|child| child != node_id);
            }
        }
        self.emit_model_change(ModelChangeVerb::NodeDeleted, node_id.clone());
    }

    /// Rename a node id in place, preserving its subtree position. Used
    /// to mimic server-side collection compaction.
    pub fn rename_node(&self, from: &NodeId, to: NodeId) {
        let mut space = self.inner.space.lock().unwrap();
        let Some(mut node) = space.nodes.remove(from) else {
            return;
        };
        if let Some(index) = to.collection_index() {
            if let Some((base, _)) = split_indexed_name(&node.browse_name) {
                node.browse_name = format!("{}[{}]", base, index);
            }
        }
        let parent = node.parent.clone();
        space.nodes.insert(to.clone(), node);
        if let Some(parent) = parent {
            if let Some(entry) = space.nodes.get_mut(&parent) {
                for child in &mut entry.children {
                    if child == from {
                        *child = to.clone();
                    }
                }
            }
        }
    }

    /// Change a variable's value, notifying monitored items.
    pub fn set_value(&self, node_id: &NodeId, value: Variant) {
        {
            let mut space = self.inner.space.lock().unwrap();
            let Some(node) = space.nodes.get_mut(node_id) else {
                return;
            };
            node.value = value.clone();
        }
        self.notify_value(node_id, value);
    }

    pub fn value(&self, node_id: &NodeId) -> Option<Variant> {
        let space = self.inner.space.lock().unwrap();
        space.nodes.get(node_id).map(|node| node.value.clone())
    }

    pub fn set_read_status(&self, node_id: &NodeId, status: StatusCode) {
        let mut space = self.inner.space.lock().unwrap();
        if let Some(node) = space.nodes.get_mut(node_id) {
            node.read_status = status;
        }
    }

    pub fn set_write_status(&self, node_id: &NodeId, status: StatusCode) {
        let mut space = self.inner.space.lock().unwrap();
        if let Some(node) = space.nodes.get_mut(node_id) {
            node.write_status = status;
        }
    }

    /// Script the status monitored-item creation returns for a node.
    pub fn set_monitor_status(&self, node_id: &NodeId, status: StatusCode) {
        let mut space = self.inner.space.lock().unwrap();
        if let Some(node) = space.nodes.get_mut(node_id) {
            node.monitor_status = status;
        }
    }

    /// Every write accepted so far, in submission order.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.inner.writes.lock().unwrap().clone()
    }

    /// Make the next `count` read calls fail at the service level.
    pub fn fail_next_reads(&self, count: u32) {
        self.inner.fail_reads.store(count, Ordering::Relaxed);
    }

    /// Drop the current session: it stops answering, and a failing
    /// keep-alive is delivered.
    pub fn drop_session(&self) {
        let session = self.inner.current.lock().unwrap().clone();
        let Some(session) = session else {
            return;
        };
        session.connected.store(false, Ordering::Release);
        session.fire_keep_alive(KeepAlive {
            status: StatusCode::BadNoCommunication,
            server_state: ServerState::Failed,
        });
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| session.id)
    }

    fn emit_model_change(&self, verb: ModelChangeVerb, affected: NodeId) {
        let session = self.inner.current.lock().unwrap().clone();
        let Some(session) = session else {
            return;
        };
        if !session.connected.load(Ordering::Acquire) {
            return;
        }
        let handler = session.model_change_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(&ModelChangeEvent {
                verb,
                affected,
                affected_type: None,
            });
        }
    }

    fn notify_value(&self, node_id: &NodeId, value: Variant) {
        let session = self.inner.current.lock().unwrap().clone();
        let Some(session) = session else {
            return;
        };
        if !session.connected.load(Ordering::Acquire) {
            return;
        }
        let subscriptions = session.subscriptions.lock().unwrap().clone();
        for subscription in subscriptions {
            subscription.notify(node_id, value.clone());
        }
    }

    fn make_session(&self) -> Arc<SimSession> {
        let session = Arc::new(SimSession {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            server: self.clone(),
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            keep_alive_handler: Mutex::new(None),
            model_change_handler: Mutex::new(None),
        });
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session.id, Arc::downgrade(&session));
        *self.inner.current.lock().unwrap() = Some(Arc::clone(&session));
        session
    }

    fn session_by_id(&self, id: SessionId) -> Option<Arc<SimSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade)
    }
}

/// [`Connector`] for the simulated server.
pub struct SimConnector {
    server: SimServer,
    handler: Arc<SimReconnectHandler>,
    fail_connects: AtomicU32,
}

impl SimConnector {
    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::Relaxed);
    }

    /// The concrete handler, for driving reconnects from tests.
    pub fn sim_reconnect_handler(&self) -> Arc<SimReconnectHandler> {
        Arc::clone(&self.handler)
    }
}

impl Connector for SimConnector {
    fn connect(
        &self,
        options: &EndpointOptions,
    ) -> Result<Arc<dyn UaSession>, StatusCode> {
        let remaining = self.fail_connects.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::Relaxed);
            return Err(StatusCode::BadNoCommunication);
        }
        debug!(url = %options.server_url, "sim connect");
        Ok(self.server.make_session())
    }

    fn reconnect_handler(&self) -> Arc<dyn ReconnectHandler> {
        Arc::clone(&self.handler) as Arc<dyn ReconnectHandler>
    }
}

/// Manually driven reconnect handler.
///
/// `begin_reconnect` parks the request; a test (or the demo driver)
/// finishes it with one of the `complete_*` methods.
pub struct SimReconnectHandler {
    server: SimServer,
    state: Mutex<ReconnectState>,
    pending: Mutex<Option<(Arc<dyn UaSession>, ReconnectCallback)>>,
    result: Mutex<Option<Arc<dyn UaSession>>>,
}

impl SimReconnectHandler {
    /// Finish the pending reconnect with a fresh session, transferring
    /// the old session's subscriptions to it.
    pub fn complete_with_transfer(&self) {
        let Some((old, callback)) = self.pending.lock().unwrap().take()
        else {
            return;
        };
        let new_session = self.server.make_session();
        if let Some(old) = self.server.session_by_id(old.id()) {
            let mut moved = old.subscriptions.lock().unwrap();
            let mut adopted = new_session.subscriptions.lock().unwrap();
            adopted.extend(moved.drain(..));
        }
        *self.result.lock().unwrap() =
            Some(Arc::clone(&new_session) as Arc<dyn UaSession>);
        *self.state.lock().unwrap() = ReconnectState::Ready;
        callback();
    }

    /// Finish the pending reconnect by reviving the original session.
    pub fn complete_preserved(&self) {
        let Some((old, callback)) = self.pending.lock().unwrap().take()
        else {
            return;
        };
        if let Some(session) = self.server.session_by_id(old.id()) {
            session.connected.store(true, Ordering::Release);
            *self.server.inner.current.lock().unwrap() = Some(session);
        }
        *self.result.lock().unwrap() = Some(old);
        *self.state.lock().unwrap() = ReconnectState::Ready;
        callback();
    }

    /// Finish the pending reconnect unsuccessfully.
    pub fn complete_failed(&self) {
        let Some((_old, callback)) = self.pending.lock().unwrap().take()
        else {
            return;
        };
        *self.result.lock().unwrap() = None;
        *self.state.lock().unwrap() = ReconnectState::Ready;
        callback();
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }
}

impl ReconnectHandler for SimReconnectHandler {
    fn state(&self) -> ReconnectState {
        *self.state.lock().unwrap()
    }

    fn begin_reconnect(
        &self,
        session: &Arc<dyn UaSession>,
        on_complete: ReconnectCallback,
    ) -> ReconnectState {
        let mut state = self.state.lock().unwrap();
        if *state != ReconnectState::Ready {
            return *state;
        }
        *state = ReconnectState::Reconnecting;
        *self.pending.lock().unwrap() =
            Some((Arc::clone(session), on_complete));
        ReconnectState::Triggered
    }

    fn session(&self) -> Option<Arc<dyn UaSession>> {
        self.result.lock().unwrap().clone()
    }

    fn cancel(&self) {
        *self.pending.lock().unwrap() = None;
        *self.state.lock().unwrap() = ReconnectState::Ready;
    }
}

/// A session against the simulated server.
pub struct SimSession {
    id: SessionId,
    server: SimServer,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<Arc<SimSubscription>>>,
    keep_alive_handler: Mutex<Option<KeepAliveHandler>>,
    model_change_handler: Mutex<Option<ModelChangeHandler>>,
}

impl SimSession {
    fn fire_keep_alive(&self, event: KeepAlive) {
        let handler = self.keep_alive_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(self.id, &event);
        }
    }

    fn check_connected(&self) -> Result<(), StatusCode> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StatusCode::BadSessionIdInvalid)
        }
    }
}

impl UaSession for SimSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn browse(&self, node: &NodeId) -> Result<Vec<BrowseItem>, StatusCode> {
        self.check_connected()?;
        let space = self.server.inner.space.lock().unwrap();
        let Some(entry) = space.nodes.get(node) else {
            return Err(StatusCode::BadNodeIdUnknown);
        };
        Ok(entry
            .children
            .iter()
            .filter_map(|child_id| {
                space.nodes.get(child_id).map(|child| BrowseItem {
                    node_id: child_id.clone(),
                    browse_name: child.browse_name.clone(),
                    node_class: child.node_class,
                    type_definition: child.type_definition.clone(),
                })
            })
            .collect())
    }

    fn read_node_info(&self, node: &NodeId) -> Result<NodeInfo, StatusCode> {
        self.check_connected()?;
        let space = self.server.inner.space.lock().unwrap();
        let Some(entry) = space.nodes.get(node) else {
            return Err(StatusCode::BadNodeIdUnknown);
        };
        Ok(NodeInfo {
            node_id: node.clone(),
            browse_name: entry.browse_name.clone(),
            node_class: entry.node_class,
            parent: entry.parent.clone(),
        })
    }

    fn read(&self, nodes: &[NodeId]) -> Result<Vec<DataValue>, StatusCode> {
        self.check_connected()?;
        let failing = self.server.inner.fail_reads.load(Ordering::Relaxed);
        if failing > 0 {
            self.server
                .inner
                .fail_reads
                .store(failing - 1, Ordering::Relaxed);
            return Err(StatusCode::BadTimeout);
        }
        let space = self.server.inner.space.lock().unwrap();
        Ok(nodes
            .iter()
            .map(|node_id| match space.nodes.get(node_id) {
                Some(node) if node.read_status.is_good() => {
                    DataValue::good(node.value.clone())
                }
                Some(node) => DataValue::bad(node.read_status),
                None => DataValue::bad(StatusCode::BadNodeIdUnknown),
            })
            .collect())
    }

    fn write(
        &self,
        requests: &[WriteRequest],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.check_connected()?;
        let limit = self
            .server
            .inner
            .max_nodes_per_write
            .load(Ordering::Relaxed) as usize;
        if limit > 0 && requests.len() > limit {
            return Err(StatusCode::BadTooManyOperations);
        }
        let mut notifications = Vec::new();
        let statuses = {
            let mut space = self.server.inner.space.lock().unwrap();
            requests
                .iter()
                .map(|request| match space.nodes.get_mut(&request.node_id) {
                    Some(node) => {
                        if node.write_status.is_good() {
                            node.value = request.value.clone();
                            notifications.push((
                                request.node_id.clone(),
                                request.value.clone(),
                            ));
                            self.server
                                .inner
                                .writes
                                .lock()
                                .unwrap()
                                .push(request.clone());
                        }
                        node.write_status
                    }
                    None => StatusCode::BadNodeIdUnknown,
                })
                .collect()
        };
        for (node_id, value) in notifications {
            self.server.notify_value(&node_id, value);
        }
        Ok(statuses)
    }

    fn max_nodes_per_write(&self) -> usize {
        self.server
            .inner
            .max_nodes_per_write
            .load(Ordering::Relaxed) as usize
    }

    fn create_subscription(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn UaSubscription>, StatusCode> {
        self.check_connected()?;
        let subscription = Arc::new(SimSubscription {
            id: self
                .server
                .inner
                .next_subscription
                .fetch_add(1, Ordering::Relaxed),
            server: self.server.clone(),
            options: options.clone(),
            created: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            deleted: AtomicBool::new(false),
        });
        self.subscriptions
            .lock()
            .unwrap()
            .push(Arc::clone(&subscription));
        Ok(subscription)
    }

    fn subscriptions(&self) -> Vec<Arc<dyn UaSubscription>> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn UaSubscription>)
            .collect()
    }

    fn set_keep_alive_handler(&self, handler: Option<KeepAliveHandler>) {
        *self.keep_alive_handler.lock().unwrap() = handler;
    }

    fn set_model_change_handler(&self, handler: Option<ModelChangeHandler>) {
        *self.model_change_handler.lock().unwrap() = handler;
    }

    fn close(&self) -> Result<(), StatusCode> {
        self.connected.store(false, Ordering::Release);
        let mut current = self.server.inner.current.lock().unwrap();
        if let Some(session) = current.as_ref() {
            if session.id == self.id {
                *current = None;
            }
        }
        Ok(())
    }
}

struct SimItem {
    request: MonitoredItemRequest,
}

/// A subscription on the simulated server.
pub struct SimSubscription {
    id: u32,
    server: SimServer,
    options: SubscriptionOptions,
    created: Mutex<HashMap<ClientHandle, SimItem>>,
    /// Staged or previously-failed items, re-evaluated on every apply.
    pending: Mutex<Vec<(ClientHandle, MonitoredItemRequest)>>,
    statuses: Mutex<Vec<ItemStatus>>,
    handler: Mutex<Option<DataChangeHandler>>,
    deleted: AtomicBool,
}

impl SimSubscription {
    fn notify(&self, node_id: &NodeId, value: Variant) {
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        let handles: Vec<ClientHandle> = {
            let created = self.created.lock().unwrap();
            created
                .iter()
                .filter(|(_, item)| item.request.node_id == *node_id)
                .map(|(handle, _)| *handle)
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else {
            return;
        };
        let notifications: Vec<Notification> = handles
            .into_iter()
            .map(|client_handle| Notification {
                client_handle,
                value: DataValue::good(value.clone()),
            })
            .collect();
        handler(&notifications);
    }
}

impl UaSubscription for SimSubscription {
    fn id(&self) -> u32 {
        self.id
    }

    fn add_item(&self, request: MonitoredItemRequest) -> ClientHandle {
        let handle = self
            .server
            .inner
            .next_handle
            .fetch_add(1, Ordering::Relaxed);
        self.pending.lock().unwrap().push((handle, request));
        handle
    }

    fn remove_item(&self, handle: ClientHandle) {
        self.created.lock().unwrap().remove(&handle);
        self.pending
            .lock()
            .unwrap()
            .retain(|(pending, _)| *pending != handle);
        self.statuses
            .lock()
            .unwrap()
            .retain(|status| status.client_handle != handle);
    }

    fn apply_changes(&self) -> Result<(), StatusCode> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(StatusCode::BadOutOfService);
        }
        let pending: Vec<(ClientHandle, MonitoredItemRequest)> =
            self.pending.lock().unwrap().drain(..).collect();
        let mut initial = Vec::new();
        {
            let space = self.server.inner.space.lock().unwrap();
            let mut created = self.created.lock().unwrap();
            let mut statuses = self.statuses.lock().unwrap();
            let mut still_pending = Vec::new();
            for (handle, request) in pending {
                let (status, value) = match space.nodes.get(&request.node_id)
                {
                    Some(node) => (node.monitor_status, node.value.clone()),
                    None => (StatusCode::BadNodeIdUnknown, Variant::Empty),
                };
                let revised_sampling_interval =
                    if request.sampling_interval.is_zero() {
                        self.options.publishing_interval
                    } else {
                        request.sampling_interval
                    };
                statuses.retain(|s| s.client_handle != handle);
                statuses.push(ItemStatus {
                    client_handle: handle,
                    node_id: request.node_id.clone(),
                    created: status.is_good(),
                    status,
                    revised_sampling_interval,
                });
                if status.is_good() {
                    initial.push(Notification {
                        client_handle: handle,
                        value: DataValue::good(value),
                    });
                    created.insert(handle, SimItem { request });
                } else {
                    still_pending.push((handle, request));
                }
            }
            self.pending.lock().unwrap().extend(still_pending);
        }
        // Initial-value notifications follow a successful create.
        if !initial.is_empty() {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(&initial);
            }
        }
        Ok(())
    }

    fn item_statuses(&self) -> Vec<ItemStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn monitored_item_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn set_data_change_handler(&self, handler: Option<DataChangeHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn delete(&self) -> Result<(), StatusCode> {
        self.deleted.store(true, Ordering::Release);
        self.created.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
        self.statuses.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            publishing_interval: Duration::from_millis(100),
            keep_alive_count: 10,
            lifetime_count: 30,
            priority: 0,
            max_notifications_per_publish: 0,
        }
    }

    fn endpoint() -> EndpointOptions {
        EndpointOptions {
            server_url: "opc.tcp://sim".into(),
            application_name: "test".into(),
            session_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn subscription_delivers_initial_and_changed_values() {
        let server = SimServer::new();
        let root = NodeId::numeric(0, 85);
        let speed = NodeId::string(2, "Motor/Speed");
        server.add_object(None, root.clone(), "Objects");
        server.add_variable(
            Some(&root),
            speed.clone(),
            "Speed",
            Variant::Double(1.0),
        );

        let connector = server.connector();
        let session = connector.connect(&endpoint()).unwrap();
        let subscription = session.create_subscription(&options()).unwrap();
        let (tx, rx) = mpsc::channel();
        subscription.set_data_change_handler(Some(Arc::new(
            move |notifications: &[Notification]| {
                for n in notifications {
                    let _ = tx.send(n.value.value.clone());
                }
            },
        )));
        let handle = subscription.add_item(MonitoredItemRequest {
            node_id: speed.clone(),
            sampling_interval: Duration::from_millis(0),
            queue_size: 1,
            discard_oldest: true,
            filter: None,
        });
        subscription.apply_changes().unwrap();

        assert_eq!(rx.try_recv().unwrap(), Variant::Double(1.0));
        server.set_value(&speed, Variant::Double(2.0));
        assert_eq!(rx.try_recv().unwrap(), Variant::Double(2.0));

        let statuses = subscription.item_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].client_handle, handle);
        assert!(statuses[0].created);
        // Zero sampling was revised up to the publishing interval.
        assert_eq!(
            statuses[0].revised_sampling_interval,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn dropped_session_fires_keep_alive_and_stops_answering() {
        let server = SimServer::new();
        let root = NodeId::numeric(0, 85);
        server.add_object(None, root.clone(), "Objects");
        let connector = server.connector();
        let session = connector.connect(&endpoint()).unwrap();

        let (tx, rx) = mpsc::channel();
        session.set_keep_alive_handler(Some(Arc::new(
            move |id, event: &KeepAlive| {
                let _ = tx.send((id, event.status, event.server_state));
            },
        )));
        server.drop_session();
        let (id, status, state) = rx.try_recv().unwrap();
        assert_eq!(id, session.id());
        assert!(status.is_bad());
        assert_eq!(state, ServerState::Failed);
        assert!(session.browse(&root).is_err());
    }

    #[test]
    fn reconnect_with_transfer_moves_subscriptions() {
        let server = SimServer::new();
        let root = NodeId::numeric(0, 85);
        server.add_object(None, root.clone(), "Objects");
        let connector = server.connector();
        let session = connector.connect(&endpoint()).unwrap();
        let _subscription = session.create_subscription(&options()).unwrap();

        server.drop_session();
        let handler = connector.sim_reconnect_handler();
        let state =
            handler.begin_reconnect(&session, Arc::new(|| {}));
        assert_eq!(state, ReconnectState::Triggered);
        handler.complete_with_transfer();

        let new_session = handler.session().unwrap();
        assert_ne!(new_session.id(), session.id());
        assert_eq!(new_session.subscriptions().len(), 1);
        assert!(session.subscriptions().is_empty());
    }
}
