//! Traits implemented by the OPC UA client library.
//!
//! The runtime is written entirely against these traits. A conforming
//! implementation wraps a real codec; [`crate::sim`] provides an
//! in-process one.

use std::sync::Arc;
use std::time::Duration;

use crate::ua::{DataValue, NodeId, StatusCode, Variant};

/// Client-side identity of a session instance. A reconnect that replaces
/// the transport session yields a new id; a reconnect that preserves it
/// keeps the old one.
pub type SessionId = u32;

/// Locally-assigned integer identifying a monitored item within a
/// subscription.
pub type ClientHandle = u32;

/// Node class of a browsed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
}

/// One hierarchical reference returned by a browse.
#[derive(Debug, Clone)]
pub struct BrowseItem {
    pub node_id: NodeId,
    pub browse_name: String,
    pub node_class: NodeClass,
    /// Type definition of the target, used to validate container nodes.
    pub type_definition: Option<NodeId>,
}

/// Node details for a single node, used when dispatching added-node
/// events.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub browse_name: String,
    pub node_class: NodeClass,
    pub parent: Option<NodeId>,
}

/// A single value write.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub node_id: NodeId,
    pub value: Variant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChangeTrigger {
    Status,
    StatusValue,
    StatusValueTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadbandType {
    None,
    Absolute,
    Percent,
}

/// Per-item filter suppressing notifications below a change threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeFilter {
    pub trigger: DataChangeTrigger,
    pub deadband_type: DeadbandType,
    pub deadband_value: f64,
}

/// Parameters for one monitored item.
#[derive(Debug, Clone)]
pub struct MonitoredItemRequest {
    pub node_id: NodeId,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: Option<DataChangeFilter>,
}

/// Creation status of one monitored item, as revised by the server.
#[derive(Debug, Clone)]
pub struct ItemStatus {
    pub client_handle: ClientHandle,
    pub node_id: NodeId,
    pub created: bool,
    pub status: StatusCode,
    pub revised_sampling_interval: Duration,
}

/// Parameters shared by the monitored items of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub publishing_interval: Duration,
    pub keep_alive_count: u32,
    pub lifetime_count: u32,
    pub priority: u8,
    pub max_notifications_per_publish: u32,
}

/// One entry of a data-change notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub client_handle: ClientHandle,
    pub value: DataValue,
}

/// Invoked on a transport thread with the items of one publish response.
/// Calls are sequential per subscription but concurrent across
/// subscriptions.
pub type DataChangeHandler = Arc<dyn Fn(&[Notification]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Unknown,
    Failed,
}

/// Periodic liveness signal from the session.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub status: StatusCode,
    pub server_state: ServerState,
}

/// Invoked on a transport thread with the id of the session the event
/// belongs to.
pub type KeepAliveHandler = Arc<dyn Fn(SessionId, &KeepAlive) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChangeVerb {
    NodeAdded,
    NodeDeleted,
    ReferenceAdded,
    ReferenceDeleted,
}

/// Server notification of a structural change in the address space.
#[derive(Debug, Clone)]
pub struct ModelChangeEvent {
    pub verb: ModelChangeVerb,
    pub affected: NodeId,
    pub affected_type: Option<NodeId>,
}

pub type ModelChangeHandler = Arc<dyn Fn(&ModelChangeEvent) + Send + Sync>;

/// A group of monitored items sharing publishing parameters.
///
/// Item mutations are staged: `add_item`/`remove_item` only take effect
/// on the server once `apply_changes` runs. Client handles are assigned
/// at staging time and survive session transfer.
pub trait UaSubscription: Send + Sync {
    fn id(&self) -> u32;

    /// Stage a monitored item; returns its client handle.
    fn add_item(&self, request: MonitoredItemRequest) -> ClientHandle;

    /// Stage removal of a monitored item. Unknown handles are ignored.
    fn remove_item(&self, handle: ClientHandle);

    /// Commit staged mutations and retry failed items.
    fn apply_changes(&self) -> Result<(), StatusCode>;

    /// Per-item creation results after the last `apply_changes`.
    fn item_statuses(&self) -> Vec<ItemStatus>;

    fn monitored_item_count(&self) -> usize;

    fn set_data_change_handler(&self, handler: Option<DataChangeHandler>);

    /// Delete the subscription on the server.
    fn delete(&self) -> Result<(), StatusCode>;
}

/// A transport-level session.
pub trait UaSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn is_connected(&self) -> bool;

    /// Hierarchical forward references of `node`. Continuation points are
    /// the codec's concern; the result is always complete.
    fn browse(&self, node: &NodeId) -> Result<Vec<BrowseItem>, StatusCode>;

    fn read_node_info(&self, node: &NodeId) -> Result<NodeInfo, StatusCode>;

    /// Read the value attribute of each node. The result has the same
    /// order and length as the request.
    fn read(&self, nodes: &[NodeId]) -> Result<Vec<DataValue>, StatusCode>;

    /// Write the value attribute of each node. The result has the same
    /// order and length as the request.
    fn write(
        &self,
        requests: &[WriteRequest],
    ) -> Result<Vec<StatusCode>, StatusCode>;

    /// Server operation limit for a single write call. Zero means
    /// unlimited.
    fn max_nodes_per_write(&self) -> usize;

    fn create_subscription(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn UaSubscription>, StatusCode>;

    /// Subscriptions currently owned by this session, including any
    /// transferred to it during a reconnect.
    fn subscriptions(&self) -> Vec<Arc<dyn UaSubscription>>;

    fn set_keep_alive_handler(&self, handler: Option<KeepAliveHandler>);

    fn set_model_change_handler(&self, handler: Option<ModelChangeHandler>);

    fn close(&self) -> Result<(), StatusCode>;
}

/// State of the transport's reconnect handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Idle; a reconnect may be initiated.
    Ready,
    /// A reconnect was accepted and is about to run.
    Triggered,
    /// A reconnect is in progress.
    Reconnecting,
}

/// Invoked on a transport thread when a reconnect attempt concludes.
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// The transport's automatic session recovery mechanism.
pub trait ReconnectHandler: Send + Sync {
    fn state(&self) -> ReconnectState;

    /// Start reconnecting `session`. `on_complete` fires when the attempt
    /// concludes, successfully or not.
    fn begin_reconnect(
        &self,
        session: &Arc<dyn UaSession>,
        on_complete: ReconnectCallback,
    ) -> ReconnectState;

    /// The session produced by the last completed reconnect: the original
    /// (preserved), a replacement, or `None` if the attempt failed.
    fn session(&self) -> Option<Arc<dyn UaSession>>;

    /// Abandon any in-progress attempt and return to `Ready`.
    fn cancel(&self);
}

/// Endpoint parameters for session creation.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub server_url: String,
    pub application_name: String,
    pub session_timeout: Duration,
    pub reconnect_interval: Duration,
}

/// Factory for sessions against one endpoint.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        options: &EndpointOptions,
    ) -> Result<Arc<dyn UaSession>, StatusCode>;

    /// The reconnect handler coupled to sessions from this connector.
    fn reconnect_handler(&self) -> Arc<dyn ReconnectHandler>;
}
