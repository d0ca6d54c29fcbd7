//! Structural hashing state and the incremental diff engine.
//!
//! Each agent keeps a rolling checkpoint hash of its own subtree plus a
//! log of addresses touched since older checkpoints. Peers ask "what
//! changed since hash H" and get either a cheap incremental diff or, when
//! H is unknown or history has been pruned, a full snapshot.

pub mod messages;

use crate::address::Address;
use crate::error::KorError;
use crate::storage::{is_excluded, StorageBackend};
use crate::tree::NodeTree;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

pub use messages::{HandshakeSummary, KorMessage, KorUpdate, StructureNode};

/// Hash value a peer sends to request full history.
pub const FULL_SYNC_REQUEST: &str = "*";

/// Retained change-log window; a `from` hash older than this degrades the
/// reply to a full update.
const LOG_CAPACITY: usize = 1024;

pub fn format_hash(hash: u64) -> String {
    format!("{:016x}", hash)
}

pub fn parse_hash(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw, 16).ok()
}

/// Ordered (changed address, checkpoint hash) history with the checkpoint
/// the window is anchored on.
#[derive(Debug)]
pub struct StructuralLog {
    /// Hash the tree had before the oldest retained entry.
    anchor: u64,
    entries: VecDeque<(Address, u64)>,
    capacity: usize,
}

impl StructuralLog {
    pub fn new(initial_hash: u64) -> Self {
        StructuralLog {
            anchor: initial_hash,
            entries: VecDeque::new(),
            capacity: LOG_CAPACITY,
        }
    }

    pub fn current_hash(&self) -> u64 {
        self.entries.back().map(|(_, h)| *h).unwrap_or(self.anchor)
    }

    /// Append a change and the checkpoint hash taken right after it.
    pub fn record(&mut self, address: Address, checkpoint: u64) {
        self.entries.push_back((address, checkpoint));
        while self.entries.len() > self.capacity {
            if let Some((_, hash)) = self.entries.pop_front() {
                self.anchor = hash;
            }
        }
    }

    /// Addresses changed since the checkpoint `from`, oldest first.
    /// `None` when `from` is not in the retained window.
    pub fn changes_since(&self, from: u64) -> Option<Vec<Address>> {
        if from == self.current_hash() {
            return Some(Vec::new());
        }
        if from == self.anchor {
            return Some(self.entries.iter().map(|(a, _)| a.clone()).collect());
        }
        let idx = self.entries.iter().rposition(|(_, h)| *h == from)?;
        Some(
            self.entries
                .iter()
                .skip(idx + 1)
                .map(|(a, _)| a.clone())
                .collect(),
        )
    }
}

/// One agent's sync state: identity, owned subtree, exclusions, log.
///
/// The repository keeps this behind its structural mutex so a change and
/// its checkpoint can never interleave with another structural mutation.
pub struct SyncState {
    agent_name: String,
    agent_root: Address,
    excluded: Vec<String>,
    log: StructuralLog,
}

impl SyncState {
    pub fn new(
        agent_name: String,
        agent_root: Address,
        excluded: Vec<String>,
        backend: &dyn StorageBackend,
    ) -> Result<Self, KorError> {
        let initial = backend.structural_hash(&agent_root, &excluded)?;
        Ok(SyncState {
            agent_name,
            agent_root,
            excluded,
            log: StructuralLog::new(initial),
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn agent_root(&self) -> &Address {
        &self.agent_root
    }

    pub fn current_hash(&self) -> u64 {
        self.log.current_hash()
    }

    /// Record a structural mutation under the local subtree and take a new
    /// checkpoint. Returns (hash before, hash after). Changes inside the
    /// excluded internal subtree are invisible to peers and not logged.
    pub fn record_change(
        &mut self,
        backend: &dyn StorageBackend,
        address: &Address,
    ) -> Result<(u64, u64), KorError> {
        let pre = self.log.current_hash();
        if is_excluded(&self.agent_root, address, &self.excluded) {
            return Ok((pre, pre));
        }
        let checkpoint = backend.structural_hash(&self.agent_root, &self.excluded)?;
        self.log.record(address.clone(), checkpoint);
        debug!(address = %address, hash = %format_hash(checkpoint), "structural checkpoint");
        Ok((pre, checkpoint))
    }

    /// Build the update a peer holding `from` needs to catch up.
    pub fn update_from_hash(
        &self,
        backend: &dyn StorageBackend,
        from: &str,
    ) -> Result<KorUpdate, KorError> {
        let changes = if from.is_empty() || from == FULL_SYNC_REQUEST {
            None
        } else {
            parse_hash(from).and_then(|h| self.log.changes_since(h))
        };
        match changes {
            Some(addresses) => self.incremental_update(backend, from, addresses),
            None => self.full_update(backend),
        }
    }

    fn full_update(&self, backend: &dyn StorageBackend) -> Result<KorUpdate, KorError> {
        let metas = backend.get_metadata(&self.agent_root, true)?;
        let mut added = BTreeMap::new();
        for (addr, meta) in metas {
            if is_excluded(&self.agent_root, &addr, &self.excluded) {
                continue;
            }
            added.insert(
                addr,
                StructureNode {
                    types: meta.types,
                    reader_ids: meta.reader_ids,
                    writer_ids: meta.writer_ids,
                    restriction: meta.restriction,
                    cache_hint: meta.cache_hint,
                    children: BTreeMap::new(),
                },
            );
        }
        Ok(KorUpdate {
            hash_from: String::new(),
            hash_to: format_hash(self.current_hash()),
            added_nodes: added,
            removed_nodes: BTreeSet::new(),
            agent_name: self.agent_name.clone(),
        })
    }

    fn incremental_update(
        &self,
        backend: &dyn StorageBackend,
        from: &str,
        addresses: Vec<Address>,
    ) -> Result<KorUpdate, KorError> {
        let mut added = BTreeMap::new();
        let mut removed = BTreeSet::new();
        let changed: BTreeSet<Address> = addresses.into_iter().collect();
        for addr in changed {
            if is_excluded(&self.agent_root, &addr, &self.excluded) {
                continue;
            }
            if backend.node_exists(&addr)? {
                added.insert(addr.clone(), structure_of(backend, &addr)?);
            } else {
                removed.insert(addr);
            }
        }
        Ok(KorUpdate {
            hash_from: from.to_string(),
            hash_to: format_hash(self.current_hash()),
            added_nodes: added,
            removed_nodes: removed,
            agent_name: self.agent_name.clone(),
        })
    }

    /// Apply a peer's update to the local replica of its subtree.
    ///
    /// Per-address best effort: a failed insert is rolled back by removing
    /// the address and processing continues. The local agent's own subtree
    /// is never touched.
    pub fn apply_update(&self, tree: &NodeTree, update: &KorUpdate) -> Result<(), KorError> {
        for (addr, snode) in &update.added_nodes {
            if self.agent_root.contains(addr) {
                warn!(address = %addr, origin = %update.agent_name, "update tried to add under local subtree");
                continue;
            }
            if let Err(e) = replace_structure(tree, addr, snode, &update.agent_name) {
                warn!(address = %addr, error = %e, "failed to apply added node, rolling back");
                if tree.backend().node_exists(addr).unwrap_or(false) {
                    let _ = tree.backend().remove_node(addr);
                }
            }
        }
        for addr in &update.removed_nodes {
            if self.agent_root.contains(addr) {
                warn!(address = %addr, origin = %update.agent_name, "update tried to remove under local subtree");
                continue;
            }
            // Absence is not an error: the node may never have replicated.
            if tree.backend().node_exists(addr)? {
                tree.backend().remove_node(addr)?;
            }
        }
        Ok(())
    }
}

/// Structure snapshot of a node and its declared children.
fn structure_of(backend: &dyn StorageBackend, root: &Address) -> Result<StructureNode, KorError> {
    let metas = backend.get_metadata(root, true)?;
    Ok(build_structure(root, &metas))
}

fn build_structure(
    root: &Address,
    metas: &BTreeMap<Address, crate::types::NodeMeta>,
) -> StructureNode {
    let mut node = match metas.get(root) {
        Some(meta) => StructureNode {
            types: meta.types.clone(),
            reader_ids: meta.reader_ids.clone(),
            writer_ids: meta.writer_ids.clone(),
            restriction: meta.restriction.clone(),
            cache_hint: meta.cache_hint.clone(),
            children: BTreeMap::new(),
        },
        None => StructureNode::default(),
    };
    for addr in metas.keys() {
        if addr.parent().as_ref() == Some(root) {
            if let Some(name) = addr.last_segment() {
                node.children
                    .insert(name.to_string(), build_structure(addr, metas));
            }
        }
    }
    node
}

/// Drop any existing node at `address` and recreate it (plus declared
/// children) from the structure node, attributed to the update's origin.
fn replace_structure(
    tree: &NodeTree,
    address: &Address,
    snode: &StructureNode,
    origin: &str,
) -> Result<(), KorError> {
    let backend = tree.backend();
    if backend.node_exists(address)? {
        backend.remove_node(address)?;
    }
    insert_structure(tree, address, snode, origin)
}

fn insert_structure(
    tree: &NodeTree,
    address: &Address,
    snode: &StructureNode,
    origin: &str,
) -> Result<(), KorError> {
    tree.add_node(
        address,
        snode.types.clone(),
        snode.reader_ids.clone(),
        snode.writer_ids.clone(),
        snode.restriction.clone(),
        snode.cache_hint.clone(),
        origin,
    )?;
    for (name, child) in &snode.children {
        insert_structure(tree, &address.join(name)?, child, origin)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_log_tracks_current_hash() {
        let mut log = StructuralLog::new(100);
        assert_eq!(log.current_hash(), 100);
        log.record(addr("/a/x"), 200);
        log.record(addr("/a/y"), 300);
        assert_eq!(log.current_hash(), 300);
    }

    #[test]
    fn test_changes_since_known_checkpoints() {
        let mut log = StructuralLog::new(100);
        log.record(addr("/a/x"), 200);
        log.record(addr("/a/y"), 300);
        log.record(addr("/a/z"), 400);

        assert_eq!(log.changes_since(400), Some(vec![]));
        assert_eq!(log.changes_since(300), Some(vec![addr("/a/z")]));
        assert_eq!(
            log.changes_since(100),
            Some(vec![addr("/a/x"), addr("/a/y"), addr("/a/z")])
        );
        assert_eq!(log.changes_since(999), None);
    }

    #[test]
    fn test_pruned_window_forgets_old_hashes() {
        let mut log = StructuralLog::new(0);
        log.capacity = 2;
        log.record(addr("/a/x"), 1);
        log.record(addr("/a/y"), 2);
        log.record(addr("/a/z"), 3);
        // Hash 0 slid out of the window; 1 is the new anchor.
        assert_eq!(log.changes_since(0), None);
        assert_eq!(log.changes_since(1), Some(vec![addr("/a/y"), addr("/a/z")]));
    }

    #[test]
    fn test_hash_format_round_trip() {
        let hash = 0xdead_beef_u64;
        assert_eq!(parse_hash(&format_hash(hash)), Some(hash));
        assert_eq!(parse_hash("not-a-hash"), None);
    }
}
