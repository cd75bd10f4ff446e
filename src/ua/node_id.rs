//! Type for representing OPC UA node identifiers.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// The namespace-scoped part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

/// A server-scoped node identifier.
///
/// Identifiers are opaque to the runtime except for one detail: string
/// identifiers of collection elements end in a positional `[N]` segment
/// (for example `ns=2;s=Plant/Motors[3]`), and index reconciliation
/// rewrites that segment when the server compacts a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").unwrap())
}

impl NodeId {
    pub fn numeric(namespace: u16, value: u32) -> Self {
        NodeId {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        NodeId {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }

    /// Parse a `ns=N;i=N` / `ns=N;s=...` form, as produced by
    /// [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("ns=")?;
        let (namespace, rest) = rest.split_once(';')?;
        let namespace = namespace.parse().ok()?;
        if let Some(numeric) = rest.strip_prefix("i=") {
            Some(NodeId::numeric(namespace, numeric.parse().ok()?))
        } else {
            rest.strip_prefix("s=")
                .map(|string| NodeId::string(namespace, string))
        }
    }

    /// The position encoded in the last `[N]` segment of a string
    /// identifier, if any.
    pub fn collection_index(&self) -> Option<usize> {
        let Identifier::String(path) = &self.identifier else {
            return None;
        };
        index_regex()
            .captures_iter(path)
            .last()
            .and_then(|capture| capture[1].parse().ok())
    }

    /// Rewrite the last `[N]` segment to `[index]`, e.g. when the removal
    /// of a lower-indexed sibling shifts this element down.
    pub fn with_collection_index(&self, index: usize) -> Option<NodeId> {
        let Identifier::String(path) = &self.identifier else {
            return None;
        };
        let capture = index_regex().captures_iter(path).last()?;
        let span = capture.get(0).unwrap();
        let mut rewritten = String::with_capacity(path.len());
        rewritten.push_str(&path[..span.start()]);
        rewritten.push('[');
        rewritten.push_str(&index.to_string());
        rewritten.push(']');
        rewritten.push_str(&path[span.end()..]);
        Some(NodeId::string(self.namespace, rewritten))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Numeric(value) => {
                write!(f, "ns={};i={}", self.namespace, value)
            }
            Identifier::String(value) => {
                write!(f, "ns={};s={}", self.namespace, value)
            }
        }
    }
}

/// Split a browse name of the form `Base[index]` into its parts.
pub(crate) fn split_indexed_name(name: &str) -> Option<(&str, usize)> {
    let rest = name.strip_suffix(']')?;
    let (base, index) = rest.rsplit_once('[')?;
    if base.is_empty() {
        return None;
    }
    Some((base, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        let numeric = NodeId::numeric(0, 85);
        assert_eq!(numeric.to_string(), "ns=0;i=85");
        assert_eq!(NodeId::parse("ns=0;i=85"), Some(numeric));

        let string = NodeId::string(2, "Plant/Motors[3]");
        assert_eq!(string.to_string(), "ns=2;s=Plant/Motors[3]");
        assert_eq!(NodeId::parse("ns=2;s=Plant/Motors[3]"), Some(string));
    }

    #[test]
    fn collection_index_parses_last_segment() {
        let id = NodeId::string(2, "Plant/Cells[2]/Motors[7]");
        assert_eq!(id.collection_index(), Some(7));

        let no_index = NodeId::string(2, "Plant/Motors");
        assert_eq!(no_index.collection_index(), None);

        let numeric = NodeId::numeric(2, 42);
        assert_eq!(numeric.collection_index(), None);
    }

    #[test]
    fn with_collection_index_rewrites_last_segment_only() {
        let id = NodeId::string(2, "Plant/Cells[2]/Motors[7]");
        let shifted = id.with_collection_index(6).unwrap();
        assert_eq!(shifted.to_string(), "ns=2;s=Plant/Cells[2]/Motors[6]");
        assert_eq!(shifted.collection_index(), Some(6));
    }

    #[test]
    fn indexed_browse_names() {
        assert_eq!(split_indexed_name("Motors[3]"), Some(("Motors", 3)));
        assert_eq!(split_indexed_name("Motors"), None);
        assert_eq!(split_indexed_name("[3]"), None);
        assert_eq!(split_indexed_name("Motors[x]"), None);
    }
}
