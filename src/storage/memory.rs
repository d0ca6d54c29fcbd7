//! In-memory storage backend.
//!
//! The reference implementation of [`StorageBackend`]: a single arena of
//! nodes keyed by address. Also the backend integration tests run against.

use super::{
    apply_scope, depth_selects, fold_structural_hash, is_excluded, version_bumps, StorageBackend,
};
use crate::address::Address;
use crate::clock::ExtendedClock;
use crate::error::KorError;
use crate::types::{NodeMeta, NodeRecord, ReadParams, NEVER_SET};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct ArchivedValue {
    value: Option<String>,
    timestamp: f64,
}

#[derive(Debug, Clone)]
struct StoredNode {
    meta: NodeMeta,
    value: Option<String>,
    version: i64,
    timestamp: f64,
    archive: BTreeMap<i64, ArchivedValue>,
}

impl StoredNode {
    fn structural(meta: NodeMeta) -> Self {
        StoredNode {
            meta,
            value: None,
            version: NEVER_SET,
            timestamp: 0.0,
            archive: BTreeMap::new(),
        }
    }

    fn to_record(&self, requested_version: Option<i64>) -> NodeRecord {
        match requested_version {
            Some(v) if v != self.version => {
                let archived = self.archive.get(&v);
                NodeRecord {
                    meta: self.meta.clone(),
                    value: archived.and_then(|a| a.value.clone()),
                    version: v,
                    timestamp: archived.map(|a| a.timestamp).unwrap_or(0.0),
                }
            }
            _ => NodeRecord {
                meta: self.meta.clone(),
                value: self.value.clone(),
                version: self.version,
                timestamp: self.timestamp,
            },
        }
    }
}

/// Arena-of-nodes backend; all state behind one read-write lock.
pub struct MemoryBackend {
    nodes: RwLock<BTreeMap<Address, StoredNode>>,
    clock: ExtendedClock,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(Address::root(), StoredNode::structural(root_meta()));
        MemoryBackend {
            nodes: RwLock::new(nodes),
            clock: ExtendedClock::new(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// The tree root is readable by everyone and never carries a value.
fn root_meta() -> NodeMeta {
    let mut meta = NodeMeta::new(Vec::new());
    meta.reader_ids = vec!["*".to_string()];
    meta
}

impl StorageBackend for MemoryBackend {
    fn add_node(&self, address: &Address, meta: NodeMeta) -> Result<(), KorError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(address) {
            return Err(KorError::AlreadyExists(address.to_string()));
        }
        nodes.insert(address.clone(), StoredNode::structural(meta));
        Ok(())
    }

    fn node_exists(&self, address: &Address) -> Result<bool, KorError> {
        Ok(self.nodes.read().contains_key(address))
    }

    fn get_metadata(
        &self,
        address: &Address,
        include_subtree: bool,
    ) -> Result<BTreeMap<Address, NodeMeta>, KorError> {
        let nodes = self.nodes.read();
        if !nodes.contains_key(address) {
            return Err(KorError::NotExisting(address.to_string()));
        }
        let mut out = BTreeMap::new();
        if include_subtree {
            for (addr, node) in nodes.iter() {
                if address.contains(addr) {
                    out.insert(addr.clone(), node.meta.clone());
                }
            }
        } else {
            out.insert(address.clone(), nodes[address].meta.clone());
        }
        Ok(out)
    }

    fn get_record(
        &self,
        address: &Address,
        params: &ReadParams,
    ) -> Result<BTreeMap<Address, NodeRecord>, KorError> {
        let nodes = self.nodes.read();
        if !nodes.contains_key(address) {
            return Err(KorError::NotExisting(address.to_string()));
        }
        let mut out = BTreeMap::new();
        for (addr, node) in nodes.iter() {
            if !address.contains(addr) {
                continue;
            }
            if depth_selects(address, addr, params.depth)? {
                let record = node.to_record(params.version);
                out.insert(addr.clone(), apply_scope(record, params.scope));
            }
        }
        Ok(out)
    }

    fn remove_node(&self, address: &Address) -> Result<(), KorError> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(address) {
            return Err(KorError::NotExisting(address.to_string()));
        }
        let doomed: Vec<Address> = nodes
            .keys()
            .filter(|k| address.contains(k))
            .cloned()
            .collect();
        for addr in doomed {
            nodes.remove(&addr);
        }
        Ok(())
    }

    fn set_values(&self, values: &BTreeMap<Address, String>) -> Result<f64, KorError> {
        let mut nodes = self.nodes.write();
        for address in values.keys() {
            if !nodes.contains_key(address) {
                return Err(KorError::NotExisting(address.to_string()));
            }
        }
        let timestamp = self.clock.next();
        for (address, value) in values {
            if let Some(node) = nodes.get_mut(address) {
                if node.version != NEVER_SET {
                    node.archive.insert(
                        node.version,
                        ArchivedValue { value: node.value.clone(), timestamp: node.timestamp },
                    );
                }
                node.value = Some(value.clone());
                node.timestamp = timestamp;
            }
        }
        for (address, bump) in version_bumps(values) {
            if let Some(node) = nodes.get_mut(&address) {
                node.version += bump;
            }
        }
        Ok(timestamp)
    }

    fn addresses_under(&self, root: &Address) -> Result<Vec<Address>, KorError> {
        Ok(self
            .nodes
            .read()
            .keys()
            .filter(|k| root.contains(k))
            .cloned()
            .collect())
    }

    fn structural_hash(&self, root: &Address, excluded: &[String]) -> Result<u64, KorError> {
        let nodes = self.nodes.read();
        let pairs: Vec<(String, String)> = nodes
            .iter()
            .filter(|(addr, _)| root.contains(addr) && !is_excluded(root, addr, excluded))
            .map(|(addr, node)| (addr.to_string(), node.meta.joined_types()))
            .collect();
        Ok(fold_structural_hash(
            pairs.iter().map(|(a, t)| (a.as_str(), t.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InfoScope;

    fn meta(types: &[&str]) -> NodeMeta {
        NodeMeta::new(types.iter().map(|s| s.to_string()).collect())
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_node(&addr("/a"), meta(&["/ka"])).unwrap();
        backend.add_node(&addr("/a/svc"), meta(&["/service"])).unwrap();
        backend.add_node(&addr("/a/svc/n"), meta(&["/basic/text"])).unwrap();
        backend.add_node(&addr("/a/svc/n/leaf"), meta(&["/basic/number"])).unwrap();
        backend
    }

    #[test]
    fn test_root_exists_from_the_start() {
        let backend = MemoryBackend::new();
        assert!(backend.node_exists(&Address::root()).unwrap());
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let backend = seeded();
        assert!(matches!(
            backend.add_node(&addr("/a"), meta(&[])),
            Err(KorError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_set_values_bumps_versions_below_agent_root() {
        let backend = seeded();
        let mut values = BTreeMap::new();
        values.insert(addr("/a/svc/n/leaf"), "42".to_string());
        backend.set_values(&values).unwrap();

        let record = |a: &str| {
            backend
                .get_record(&addr(a), &ReadParams::node())
                .unwrap()
                .remove(&addr(a))
                .unwrap()
        };
        assert_eq!(record("/a/svc/n/leaf").version, 0);
        assert_eq!(record("/a/svc/n").version, 0);
        assert_eq!(record("/a/svc").version, 0);
        assert_eq!(record("/a").version, NEVER_SET);
        assert_eq!(record("/a/svc/n/leaf").value.as_deref(), Some("42"));
    }

    #[test]
    fn test_set_values_shares_one_timestamp() {
        let backend = seeded();
        let mut values = BTreeMap::new();
        values.insert(addr("/a/svc/n"), "x".to_string());
        values.insert(addr("/a/svc/n/leaf"), "y".to_string());
        let ts = backend.set_values(&values).unwrap();

        let records = backend.get_record(&addr("/a/svc/n"), &ReadParams::subtree()).unwrap();
        assert_eq!(records[&addr("/a/svc/n")].timestamp, ts);
        assert_eq!(records[&addr("/a/svc/n/leaf")].timestamp, ts);
    }

    #[test]
    fn test_set_values_missing_address_is_all_or_nothing() {
        let backend = seeded();
        let mut values = BTreeMap::new();
        values.insert(addr("/a/svc/n"), "x".to_string());
        values.insert(addr("/a/svc/ghost"), "y".to_string());
        assert!(backend.set_values(&values).is_err());

        let record = backend
            .get_record(&addr("/a/svc/n"), &ReadParams::node())
            .unwrap()
            .remove(&addr("/a/svc/n"))
            .unwrap();
        assert_eq!(record.value, None);
        assert_eq!(record.version, NEVER_SET);
    }

    #[test]
    fn test_archived_value_retrievable() {
        let backend = seeded();
        let target = addr("/a/svc/n");
        let mut values = BTreeMap::new();
        values.insert(target.clone(), "first".to_string());
        backend.set_values(&values).unwrap();
        values.insert(target.clone(), "second".to_string());
        backend.set_values(&values).unwrap();

        let params = ReadParams { depth: 0, scope: InfoScope::Complete, version: Some(0) };
        let record = backend.get_record(&target, &params).unwrap().remove(&target).unwrap();
        assert_eq!(record.value.as_deref(), Some("first"));
        assert_eq!(record.version, 0);
    }

    #[test]
    fn test_remove_cascades() {
        let backend = seeded();
        backend.remove_node(&addr("/a/svc/n")).unwrap();
        assert!(!backend.node_exists(&addr("/a/svc/n")).unwrap());
        assert!(!backend.node_exists(&addr("/a/svc/n/leaf")).unwrap());
        assert!(backend.node_exists(&addr("/a/svc")).unwrap());
    }

    #[test]
    fn test_depth_selection() {
        let backend = seeded();
        let node_only = backend.get_record(&addr("/a"), &ReadParams::node()).unwrap();
        assert_eq!(node_only.len(), 1);

        let children = backend.get_record(&addr("/a"), &ReadParams::children()).unwrap();
        assert_eq!(children.len(), 2); // /a and /a/svc

        let mut bounded = ReadParams::node();
        bounded.depth = 2;
        let two_deep = backend.get_record(&addr("/a"), &bounded).unwrap();
        assert_eq!(two_deep.len(), 3); // /a, /a/svc, /a/svc/n

        let all = backend.get_record(&addr("/a"), &ReadParams::subtree()).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_structural_hash_add_remove_roundtrip() {
        let backend = seeded();
        let before = backend.structural_hash(&addr("/a"), &[]).unwrap();
        backend.add_node(&addr("/a/svc/tmp"), meta(&["/basic/text"])).unwrap();
        let during = backend.structural_hash(&addr("/a"), &[]).unwrap();
        backend.remove_node(&addr("/a/svc/tmp")).unwrap();
        let after = backend.structural_hash(&addr("/a"), &[]).unwrap();
        assert_ne!(before, during);
        assert_eq!(before, after);
    }

    #[test]
    fn test_structural_hash_excludes_subtree() {
        let backend = seeded();
        let bare = backend.structural_hash(&addr("/a"), &["svc".to_string()]).unwrap();
        backend.add_node(&addr("/a/svc/extra"), meta(&["/basic/text"])).unwrap();
        let still_bare = backend.structural_hash(&addr("/a"), &["svc".to_string()]).unwrap();
        assert_eq!(bare, still_bare);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The structural hash is a function of the (address, types)
            /// set, not of the order nodes were created in.
            #[test]
            fn prop_hash_ignores_creation_order(
                names in proptest::collection::btree_set("[a-z]{1,8}", 1..8)
            ) {
                let names: Vec<String> = names.into_iter().collect();
                let forward = MemoryBackend::new();
                let backward = MemoryBackend::new();
                forward.add_node(&addr("/a"), meta(&["/ka"])).unwrap();
                backward.add_node(&addr("/a"), meta(&["/ka"])).unwrap();
                for name in &names {
                    let address = Address::parse(&format!("/a/{}", name)).unwrap();
                    forward.add_node(&address, meta(&["/basic/text"])).unwrap();
                }
                for name in names.iter().rev() {
                    let address = Address::parse(&format!("/a/{}", name)).unwrap();
                    backward.add_node(&address, meta(&["/basic/text"])).unwrap();
                }
                prop_assert_eq!(
                    forward.structural_hash(&addr("/a"), &[]).unwrap(),
                    backward.structural_hash(&addr("/a"), &[]).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_scope_filtering() {
        let backend = seeded();
        let mut values = BTreeMap::new();
        values.insert(addr("/a/svc/n"), "v".to_string());
        backend.set_values(&values).unwrap();

        let value_only = ReadParams { depth: 0, scope: InfoScope::Value, version: None };
        let record = backend
            .get_record(&addr("/a/svc/n"), &value_only)
            .unwrap()
            .remove(&addr("/a/svc/n"))
            .unwrap();
        assert_eq!(record.value.as_deref(), Some("v"));
        assert!(record.meta.types.is_empty());

        let meta_only = ReadParams { depth: 0, scope: InfoScope::Metadata, version: None };
        let record = backend
            .get_record(&addr("/a/svc/n"), &meta_only)
            .unwrap()
            .remove(&addr("/a/svc/n"))
            .unwrap();
        assert_eq!(record.value, None);
        assert_eq!(record.version, NEVER_SET);
        assert_eq!(record.meta.types, vec!["/basic/text"]);
    }
}
