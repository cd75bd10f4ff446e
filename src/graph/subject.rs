//! Subjects and their properties.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::graph::store::SourceId;
use crate::graph::value::{ScalarType, Value};
use crate::ua::NodeId;

/// Stable identity of a subject within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(pub(crate) u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Addresses a property slot: the first path segment names a property of
/// the subject, further segments name nested attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyRef {
    pub subject: SubjectId,
    pub path: Vec<String>,
}

impl PropertyRef {
    pub fn property(subject: SubjectId, name: impl Into<String>) -> Self {
        PropertyRef {
            subject,
            path: vec![name.into()],
        }
    }

    /// The ref of an attribute nested under this slot.
    pub fn attribute(&self, name: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(name.into());
        PropertyRef {
            subject: self.subject,
            path,
        }
    }

    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subject, self.path.join("."))
    }
}

/// Kind tag of a property slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Scalar(ScalarType),
    Reference,
    Collection,
    Dictionary,
}

/// Current value of a property slot, shaped by its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(Value),
    Reference(Option<SubjectId>),
    Collection(Vec<SubjectId>),
    Dictionary(BTreeMap<String, SubjectId>),
}

/// Metadata a source attaches to a property.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEntry {
    NodeId(NodeId),
    Text(String),
    Flag(bool),
}

/// A typed slot on a subject.
///
/// Attributes are secondary slots sharing the same representation, so
/// they nest recursively.
#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) kind: PropertyKind,
    pub(crate) value: PropertyValue,
    pub(crate) writable: bool,
    pub(crate) dynamic: bool,
    pub(crate) flat_layout: bool,
    pub(crate) owner: Option<SourceId>,
    pub(crate) data: HashMap<String, DataEntry>,
    pub(crate) attributes: Vec<Property>,
}

impl Property {
    pub fn scalar(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Property {
            name: name.into(),
            kind: PropertyKind::Scalar(scalar_type),
            value: PropertyValue::Scalar(Value::Null),
            writable: false,
            dynamic: false,
            flat_layout: false,
            owner: None,
            data: HashMap::new(),
            attributes: Vec::new(),
        }
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Property {
            name: name.into(),
            kind: PropertyKind::Reference,
            value: PropertyValue::Reference(None),
            writable: false,
            dynamic: false,
            flat_layout: false,
            owner: None,
            data: HashMap::new(),
            attributes: Vec::new(),
        }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Property {
            name: name.into(),
            kind: PropertyKind::Collection,
            value: PropertyValue::Collection(Vec::new()),
            writable: false,
            dynamic: false,
            flat_layout: false,
            owner: None,
            data: HashMap::new(),
            attributes: Vec::new(),
        }
    }

    pub fn dictionary(name: impl Into<String>) -> Self {
        Property {
            name: name.into(),
            kind: PropertyKind::Dictionary,
            value: PropertyValue::Dictionary(BTreeMap::new()),
            writable: false,
            dynamic: false,
            flat_layout: false,
            owner: None,
            data: HashMap::new(),
            attributes: Vec::new(),
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Mark a collection as flat-layout: its elements are browsed as
    /// `Name[i]` children of the owning subject instead of children of a
    /// container node.
    pub fn flat(mut self) -> Self {
        self.flat_layout = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_flat_layout(&self) -> bool {
        self.flat_layout
    }

    pub fn owner(&self) -> Option<SourceId> {
        self.owner
    }

    pub fn data(&self, key: &str) -> Option<&DataEntry> {
        self.data.get(key)
    }

    /// The mapped remote node, if a source recorded one in the data bag.
    pub fn node_id(&self, key: &str) -> Option<&NodeId> {
        match self.data.get(key) {
            Some(DataEntry::NodeId(id)) => Some(id),
            _ => None,
        }
    }

    pub fn attributes(&self) -> &[Property] {
        &self.attributes
    }

    pub(crate) fn find_attribute(&self, name: &str) -> Option<&Property> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub(crate) fn find_attribute_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut Property> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }

    /// The subjects currently held by this structural slot.
    pub fn children(&self) -> Vec<SubjectId> {
        match &self.value {
            PropertyValue::Scalar(_) => Vec::new(),
            PropertyValue::Reference(child) => {
                child.iter().copied().collect()
            }
            PropertyValue::Collection(items) => items.clone(),
            PropertyValue::Dictionary(items) => {
                items.values().copied().collect()
            }
        }
    }
}

/// A back-reference from a child subject to a structural slot holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub subject: SubjectId,
    pub property: String,
}

/// A local object with a stable identity and a set of properties.
#[derive(Debug, Clone)]
pub struct Subject {
    pub(crate) id: SubjectId,
    pub(crate) name: String,
    pub(crate) properties: Vec<Property>,
    pub(crate) parents: Vec<ParentLink>,
}

impl Subject {
    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub(crate) fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// Non-owning back-references to every structural slot holding this
    /// subject.
    pub fn parents(&self) -> &[ParentLink] {
        &self.parents
    }
}
