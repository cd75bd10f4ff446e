//! The local subject graph.
//!
//! Subjects hold kind-tagged properties (scalar, reference, collection,
//! dictionary). Sources — the OPC UA client is one — claim ownership of
//! properties, attach metadata through per-property data bags, and
//! receive the changes other parties make to properties they own.
//! [`updater::SubjectUpdater`] serialises inbound value updates from
//! arbitrary threads onto a single apply thread.

mod store;
mod subject;
pub mod updater;
mod value;

pub use store::{GraphStore, SourceId, StructuralChange, WriteChange};
pub use subject::{
    DataEntry, ParentLink, Property, PropertyKind, PropertyRef,
    PropertyValue, Subject, SubjectId,
};
pub use value::{ScalarType, Value};
