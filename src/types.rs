//! Core data types shared across the KOR subsystems.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version value of a node that has never had its value set.
pub const NEVER_SET: i64 = -1;

/// Wildcard entry in a reader/writer list granting access to everyone.
pub const WILDCARD_ID: &str = "*";

/// Access level an identity holds on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    ReadWrite,
    ReadOnly,
    WriteOnly,
    None,
}

impl AccessLevel {
    /// Per-node flag attached to read results: `""` read-write, `"r"`
    /// read-only, `"w"` write-only, `"-"` no access.
    pub fn flag(self) -> &'static str {
        match self {
            AccessLevel::ReadWrite => "",
            AccessLevel::ReadOnly => "r",
            AccessLevel::WriteOnly => "w",
            AccessLevel::None => "-",
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, AccessLevel::ReadWrite | AccessLevel::ReadOnly)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessLevel::ReadWrite | AccessLevel::WriteOnly)
    }
}

/// Which fields of a record a read should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoScope {
    /// Value, version and timestamp only.
    Value,
    /// Types, identity lists and restriction only.
    Metadata,
    /// Everything.
    Complete,
}

/// Parameters of a read request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadParams {
    /// -1 = whole subtree, 0 = node only, 1 = direct children,
    /// N > 1 = bounded depth.
    pub depth: i32,
    pub scope: InfoScope,
    /// Requested archived version; `None` means latest.
    pub version: Option<i64>,
}

impl ReadParams {
    pub fn node() -> Self {
        ReadParams { depth: 0, scope: InfoScope::Complete, version: None }
    }

    pub fn subtree() -> Self {
        ReadParams { depth: -1, scope: InfoScope::Complete, version: None }
    }

    pub fn children() -> Self {
        ReadParams { depth: 1, scope: InfoScope::Complete, version: None }
    }
}

impl Default for ReadParams {
    fn default() -> Self {
        Self::node()
    }
}

/// Immutable node metadata: everything that is not the versioned value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Ordered namespaced type tags; the first is schema-significant.
    pub types: Vec<String>,
    /// Identities allowed to read. The creator is always the first entry.
    pub reader_ids: Vec<String>,
    /// Identities allowed to write. The creator is always the first entry.
    pub writer_ids: Vec<String>,
    /// Comma-separated `key='value'` restriction clauses; empty = none.
    pub restriction: String,
    /// Opaque cache hint carried through to readers.
    pub cache_hint: String,
}

impl NodeMeta {
    pub fn new(types: Vec<String>) -> Self {
        NodeMeta {
            types,
            reader_ids: Vec::new(),
            writer_ids: Vec::new(),
            restriction: String::new(),
            cache_hint: String::new(),
        }
    }

    /// Joined type list as hashed into the structural hash.
    pub fn joined_types(&self) -> String {
        self.types.join(",")
    }
}

/// Full storage-side record of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub meta: NodeMeta,
    pub value: Option<String>,
    pub version: i64,
    /// Extended timestamp of the last value change; 0.0 = never set.
    pub timestamp: f64,
}

impl NodeRecord {
    pub fn structural(meta: NodeMeta) -> Self {
        NodeRecord { meta, value: None, version: NEVER_SET, timestamp: 0.0 }
    }
}

/// A node as returned to (or supplied by) a caller: a subtree of data.
///
/// On reads every node carries the requester's derived [`AccessLevel`];
/// on writes only `address`, `value` and `children` are consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub address: Address,
    pub types: Vec<String>,
    pub value: Option<String>,
    pub version: i64,
    pub timestamp: f64,
    pub restriction: String,
    pub access: AccessLevel,
    pub children: Vec<NodeData>,
}

impl NodeData {
    /// Empty data node for `address`, used to assemble write batches.
    pub fn new(address: Address) -> Self {
        NodeData {
            address,
            types: Vec::new(),
            value: None,
            version: NEVER_SET,
            timestamp: 0.0,
            restriction: String::new(),
            access: AccessLevel::None,
            children: Vec::new(),
        }
    }

    /// Data node carrying a candidate value.
    pub fn with_value(address: Address, value: impl Into<String>) -> Self {
        let mut node = Self::new(address);
        node.value = Some(value.into());
        node
    }

    /// Flatten this subtree into (address, value) pairs for every node
    /// carrying a non-absent value.
    pub fn value_entries(&self) -> BTreeMap<Address, String> {
        let mut out = BTreeMap::new();
        self.collect_values(&mut out);
        out
    }

    fn collect_values(&self, out: &mut BTreeMap<Address, String>) {
        if let Some(v) = &self.value {
            out.insert(self.address.clone(), v.clone());
        }
        for child in &self.children {
            child.collect_values(out);
        }
    }

    /// Find a node by address anywhere in this subtree.
    pub fn find(&self, address: &Address) -> Option<&NodeData> {
        if &self.address == address {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(address))
    }
}
