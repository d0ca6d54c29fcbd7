//! The addressed tree: access-controlled façade over the storage backend.
//!
//! Every read filters the result against the requester's identity, every
//! write validates permissions and restrictions for the whole batch before
//! anything lands, and the subtree locker decides whether a write goes to
//! storage or into a lock's staging area.

use crate::access::{access_level, normalize_ids};
use crate::address::Address;
use crate::error::KorError;
use crate::lock::SubtreeLocker;
use crate::restriction::Restriction;
use crate::storage::StorageBackend;
use crate::types::{AccessLevel, InfoScope, NodeData, NodeMeta, NodeRecord, ReadParams, NEVER_SET};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// How a value batch landed: straight in storage, or staged into a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(Vec<Address>),
    Staged(Vec<Address>),
}

impl WriteOutcome {
    /// Addresses the batch covered, independent of routing.
    pub fn addresses(&self) -> &[Address] {
        match self {
            WriteOutcome::Written(a) | WriteOutcome::Staged(a) => a,
        }
    }
}

/// Access-checked view of the node store.
pub struct NodeTree {
    backend: Arc<dyn StorageBackend>,
    locker: Arc<SubtreeLocker>,
    system_id: String,
}

impl NodeTree {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        locker: Arc<SubtreeLocker>,
        system_id: impl Into<String>,
    ) -> Self {
        NodeTree { backend, locker, system_id: system_id.into() }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Create a node under an existing parent.
    ///
    /// The supplied identity lists are normalized: the creator is
    /// prepended and the system identity appended unless a wildcard
    /// already covers it.
    #[allow(clippy::too_many_arguments)]
    pub fn add_node(
        &self,
        address: &Address,
        types: Vec<String>,
        reader_ids: Vec<String>,
        writer_ids: Vec<String>,
        restriction: String,
        cache_hint: String,
        creator: &str,
    ) -> Result<(), KorError> {
        let parent = address
            .parent()
            .ok_or_else(|| KorError::InvalidAddress(address.to_string()))?;
        if !self.backend.node_exists(&parent)? {
            return Err(KorError::ParentMissing(address.to_string()));
        }
        if self.backend.node_exists(address)? {
            return Err(KorError::AlreadyExists(address.to_string()));
        }
        let meta = NodeMeta {
            types,
            reader_ids: normalize_ids(&reader_ids, creator, &self.system_id),
            writer_ids: normalize_ids(&writer_ids, creator, &self.system_id),
            restriction,
            cache_hint,
        };
        self.backend.add_node(address, meta)
    }

    /// Read a node (and per `params.depth` its subtree) as `identity`.
    ///
    /// Unreadable nodes come back blanked; a blanked node survives only if
    /// the identity can write it or a kept descendant needs it to stay
    /// addressable. Fails with `NoPermission` when the requested root
    /// itself does not survive filtering.
    pub fn get(
        &self,
        address: &Address,
        params: &ReadParams,
        identity: &str,
    ) -> Result<NodeData, KorError> {
        let complete = ReadParams {
            depth: params.depth,
            scope: InfoScope::Complete,
            version: params.version,
        };
        let records = self.backend.get_record(address, &complete)?;
        let kept = filter_records(records, identity);
        if !kept.contains_key(address) {
            return Err(KorError::NoPermission {
                address: address.to_string(),
                identity: identity.to_string(),
            });
        }
        Ok(assemble(address, kept, params.scope))
    }

    /// Write the values carried by `data` (the root plus any children with
    /// a non-absent value) as `identity`.
    ///
    /// Permission and restriction checks for the whole batch complete
    /// before any write lands. Returns the addresses written or staged.
    pub fn set_value(
        &self,
        address: &Address,
        identity: &str,
        data: &NodeData,
    ) -> Result<WriteOutcome, KorError> {
        let entries = data.value_entries();
        if entries.is_empty() {
            return Ok(WriteOutcome::Written(Vec::new()));
        }
        for addr in entries.keys() {
            if !address.contains(addr) {
                return Err(KorError::InvalidAddress(format!(
                    "{} is outside the written subtree {}",
                    addr, address
                )));
            }
        }
        self.check_writable(&entries, identity)?;

        let written: Vec<Address> = entries.keys().cloned().collect();
        if self.locker.is_locked(address) {
            if !self.locker.is_locked_by(address, identity) {
                return Err(KorError::Locked(address.to_string()));
            }
            self.locker.stage(address, identity, entries)?;
            debug!(address = %address, identity, count = written.len(), "values staged into lock");
            Ok(WriteOutcome::Staged(written))
        } else {
            for addr in entries.keys() {
                if self.locker.is_locked(addr) {
                    return Err(KorError::Locked(addr.to_string()));
                }
            }
            self.backend.set_values(&entries)?;
            debug!(address = %address, identity, count = written.len(), "values written");
            Ok(WriteOutcome::Written(written))
        }
    }

    /// Apply a committed staging batch through the unlocked write path.
    ///
    /// Permissions were checked when the pairs were staged; restrictions
    /// are evaluated again because the metadata may have changed while the
    /// lock was held.
    pub(crate) fn apply_staged(&self, values: &BTreeMap<Address, String>) -> Result<(), KorError> {
        if values.is_empty() {
            return Ok(());
        }
        for (addr, value) in values {
            let meta = self.metadata_of(addr)?;
            check_restriction(addr, &meta, value)?;
        }
        self.backend.set_values(values)?;
        Ok(())
    }

    /// Union of a node's readers and writers, the accessor set recorded in
    /// a lock taken on it.
    pub(crate) fn accessor_ids(&self, address: &Address) -> Result<Vec<String>, KorError> {
        let meta = self.metadata_of(address)?;
        let mut ids = meta.reader_ids.clone();
        for id in &meta.writer_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    fn metadata_of(&self, address: &Address) -> Result<NodeMeta, KorError> {
        let mut map = self.backend.get_metadata(address, false)?;
        map.remove(address)
            .ok_or_else(|| KorError::NotExisting(address.to_string()))
    }

    fn check_writable(
        &self,
        entries: &BTreeMap<Address, String>,
        identity: &str,
    ) -> Result<(), KorError> {
        for (addr, value) in entries {
            let meta = self.metadata_of(addr)?;
            if !access_level(&meta, identity).can_write() {
                return Err(KorError::NoPermission {
                    address: addr.to_string(),
                    identity: identity.to_string(),
                });
            }
            check_restriction(addr, &meta, value)?;
        }
        Ok(())
    }
}

fn check_restriction(addr: &Address, meta: &NodeMeta, value: &str) -> Result<(), KorError> {
    let restriction = Restriction::parse(&meta.restriction).map_err(|reason| {
        KorError::InvalidValue { address: addr.to_string(), reason }
    })?;
    restriction
        .evaluate(Some(value))
        .map_err(|reason| KorError::InvalidValue { address: addr.to_string(), reason })
}

/// Bottom-up access filtering over a flat record map.
///
/// Processing runs deepest-first so the "kept descendant" rule can look at
/// decisions already made for the subtree below each node.
fn filter_records(
    records: BTreeMap<Address, NodeRecord>,
    identity: &str,
) -> BTreeMap<Address, NodeData> {
    let mut kept: BTreeMap<Address, NodeData> = BTreeMap::new();
    for (addr, record) in records.into_iter().rev() {
        let level = access_level(&record.meta, identity);
        if level.can_read() {
            kept.insert(addr.clone(), readable_node(addr, record, level));
        } else {
            let shields_descendant = kept.keys().any(|k| addr.is_ancestor_of(k));
            if level.can_write() || shields_descendant {
                kept.insert(addr.clone(), blanked_node(addr, level));
            }
        }
    }
    kept
}

fn readable_node(address: Address, record: NodeRecord, level: AccessLevel) -> NodeData {
    NodeData {
        address,
        types: record.meta.types,
        value: record.value,
        version: record.version,
        timestamp: record.timestamp,
        restriction: record.meta.restriction,
        access: level,
        children: Vec::new(),
    }
}

/// A node the requester may not read: structure stays, content goes.
fn blanked_node(address: Address, level: AccessLevel) -> NodeData {
    NodeData {
        address,
        types: Vec::new(),
        value: None,
        version: NEVER_SET,
        timestamp: 0.0,
        restriction: String::new(),
        access: level,
        children: Vec::new(),
    }
}

/// Nest a flat kept-map back into a tree rooted at `root`, applying the
/// requested information scope to each node.
fn assemble(
    root: &Address,
    mut kept: BTreeMap<Address, NodeData>,
    scope: InfoScope,
) -> NodeData {
    for node in kept.values_mut() {
        blank_for_scope(node, scope);
    }
    let addresses: Vec<Address> = kept.keys().rev().cloned().collect();
    for addr in addresses {
        if &addr == root {
            continue;
        }
        if let Some(node) = kept.remove(&addr) {
            if let Some(parent) = addr.parent().and_then(|p| kept.get_mut(&p)) {
                parent.children.push(node);
            }
        }
    }
    let mut root_node = kept
        .remove(root)
        .unwrap_or_else(|| blanked_node(root.clone(), AccessLevel::None));
    sort_children(&mut root_node);
    root_node
}

fn blank_for_scope(node: &mut NodeData, scope: InfoScope) {
    match scope {
        InfoScope::Complete => {}
        InfoScope::Value => {
            node.types = Vec::new();
            node.restriction = String::new();
        }
        InfoScope::Metadata => {
            node.value = None;
            node.version = NEVER_SET;
            node.timestamp = 0.0;
        }
    }
}

fn sort_children(node: &mut NodeData) {
    node.children.sort_by(|a, b| a.address.cmp(&b.address));
    for child in &mut node.children {
        sort_children(child);
    }
}
