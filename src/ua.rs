//! Contract for the underlying OPC UA client library.
//!
//! The runtime never talks to a wire codec directly. Everything it needs
//! from a client library is expressed by the traits in
//! [`session`](`crate::ua::session`), and the wire-level data model lives
//! in the sibling modules. [`crate::sim`] implements the contract in
//! process for the demonstration binary and the test suite.

mod node_id;
mod session;
mod status;
mod value;

pub use node_id::{Identifier, NodeId};
pub(crate) use node_id::split_indexed_name;
pub use session::{
    BrowseItem, ClientHandle, Connector, DataChangeFilter, DataChangeHandler,
    DataChangeTrigger, DeadbandType, EndpointOptions, ItemStatus, KeepAlive,
    KeepAliveHandler, ModelChangeEvent, ModelChangeHandler, ModelChangeVerb,
    MonitoredItemRequest, NodeClass, NodeInfo, Notification,
    ReconnectCallback,
    ReconnectHandler, ReconnectState, ServerState, SessionId,
    SubscriptionOptions, UaSession, UaSubscription, WriteRequest,
};
pub use status::StatusCode;
pub use value::{DataValue, Variant};
