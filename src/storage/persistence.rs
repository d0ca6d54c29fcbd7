//! Sled-backed storage backend.
//!
//! One sled tree keyed by address string; records serialized with bincode.
//! Batch atomicity rides on sled's transactional tree.

use super::{
    apply_scope, depth_selects, fold_structural_hash, is_excluded, version_bumps, StorageBackend,
};
use crate::address::Address;
use crate::clock::ExtendedClock;
use crate::error::KorError;
use crate::types::{NodeMeta, NodeRecord, ReadParams, NEVER_SET};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk record: everything the memory backend keeps, in one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskNode {
    meta: NodeMeta,
    value: Option<String>,
    version: i64,
    timestamp: f64,
    /// version -> (archived value, archived timestamp)
    archive: BTreeMap<i64, (Option<String>, f64)>,
}

impl DiskNode {
    fn structural(meta: NodeMeta) -> Self {
        DiskNode {
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
                    value: archived.and_then(|(value, _)| value.clone()),
                    version: v,
                    timestamp: archived.map(|(_, ts)| *ts).unwrap_or(0.0),
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

fn encode(node: &DiskNode) -> Result<Vec<u8>, KorError> {
    bincode::serialize(node).map_err(|e| KorError::Storage(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<DiskNode, KorError> {
    bincode::deserialize(bytes).map_err(|e| KorError::Storage(e.to_string()))
}

/// Persistent backend over a sled database.
pub struct SledBackend {
    db: sled::Db,
    clock: ExtendedClock,
    /// Serializes structural mutations whose prefix scans cannot run
    /// inside a sled transaction.
    structural: Mutex<()>,
}

impl SledBackend {
    /// Open (or create) the store at `path`, seeding the tree root.
    pub fn open(path: &Path) -> Result<Self, KorError> {
        let db = sled::open(path)?;
        let backend = SledBackend {
            db,
            clock: ExtendedClock::new(),
            structural: Mutex::new(()),
        };
        let root = Address::root();
        if backend.read_node(&root)?.is_none() {
            let mut meta = NodeMeta::new(Vec::new());
            meta.reader_ids = vec!["*".to_string()];
            backend
                .db
                .insert(root.as_str(), encode(&DiskNode::structural(meta))?)?;
        }
        Ok(backend)
    }

    fn read_node(&self, address: &Address) -> Result<Option<DiskNode>, KorError> {
        match self.db.get(address.as_str())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Sorted addresses of the subtree at `root`, path-aware.
    fn subtree_keys(&self, root: &Address) -> Result<Vec<Address>, KorError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(root.as_str()) {
            let (key, _) = entry?;
            let raw = String::from_utf8(key.to_vec())
                .map_err(|e| KorError::Storage(e.to_string()))?;
            let addr = Address::parse(&raw)?;
            if root.contains(&addr) {
                out.push(addr);
            }
        }
        out.sort();
        Ok(out)
    }
}

impl StorageBackend for SledBackend {
    fn add_node(&self, address: &Address, meta: NodeMeta) -> Result<(), KorError> {
        let _guard = self.structural.lock();
        if self.db.get(address.as_str())?.is_some() {
            return Err(KorError::AlreadyExists(address.to_string()));
        }
        self.db
            .insert(address.as_str(), encode(&DiskNode::structural(meta))?)?;
        Ok(())
    }

    fn node_exists(&self, address: &Address) -> Result<bool, KorError> {
        Ok(self.db.get(address.as_str())?.is_some())
    }

    fn get_metadata(
        &self,
        address: &Address,
        include_subtree: bool,
    ) -> Result<BTreeMap<Address, NodeMeta>, KorError> {
        let mut out = BTreeMap::new();
        if include_subtree {
            for addr in self.subtree_keys(address)? {
                if let Some(node) = self.read_node(&addr)? {
                    out.insert(addr, node.meta);
                }
            }
        } else if let Some(node) = self.read_node(address)? {
            out.insert(address.clone(), node.meta);
        }
        if out.is_empty() {
            return Err(KorError::NotExisting(address.to_string()));
        }
        Ok(out)
    }

    fn get_record(
        &self,
        address: &Address,
        params: &ReadParams,
    ) -> Result<BTreeMap<Address, NodeRecord>, KorError> {
        if !self.node_exists(address)? {
            return Err(KorError::NotExisting(address.to_string()));
        }
        let mut out = BTreeMap::new();
        for addr in self.subtree_keys(address)? {
            if depth_selects(address, &addr, params.depth)? {
                if let Some(node) = self.read_node(&addr)? {
                    out.insert(addr, apply_scope(node.to_record(params.version), params.scope));
                }
            }
        }
        Ok(out)
    }

    fn remove_node(&self, address: &Address) -> Result<(), KorError> {
        let _guard = self.structural.lock();
        if self.db.get(address.as_str())?.is_none() {
            return Err(KorError::NotExisting(address.to_string()));
        }
        for addr in self.subtree_keys(address)? {
            self.db.remove(addr.as_str())?;
        }
        Ok(())
    }

    fn set_values(&self, values: &BTreeMap<Address, String>) -> Result<f64, KorError> {
        let bumps = version_bumps(values);
        let result: Result<f64, TransactionError<KorError>> = self.db.transaction(|tx| {
            let mut batch: BTreeMap<&Address, DiskNode> = BTreeMap::new();
            for address in values.keys().chain(bumps.keys()) {
                if batch.contains_key(address) {
                    continue;
                }
                match tx.get(address.as_str())? {
                    Some(bytes) => {
                        let node = decode(&bytes)
                            .map_err(ConflictableTransactionError::Abort)?;
                        batch.insert(address, node);
                    }
                    None if values.contains_key(address) => {
                        return Err(ConflictableTransactionError::Abort(
                            KorError::NotExisting(address.to_string()),
                        ));
                    }
                    // A bumped ancestor outside this store's replica is skipped.
                    None => {}
                }
            }
            let timestamp = self.clock.next();
            for (address, value) in values {
                if let Some(node) = batch.get_mut(address) {
                    if node.version != NEVER_SET {
                        node.archive
                            .insert(node.version, (node.value.clone(), node.timestamp));
                    }
                    node.value = Some(value.clone());
                    node.timestamp = timestamp;
                }
            }
            for (address, bump) in &bumps {
                if let Some(node) = batch.get_mut(address) {
                    node.version += bump;
                }
            }
            for (address, node) in &batch {
                let bytes = encode(node).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(address.as_str().as_bytes(), bytes)?;
            }
            Ok(timestamp)
        });
        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => KorError::Storage(e.to_string()),
        })
    }

    fn addresses_under(&self, root: &Address) -> Result<Vec<Address>, KorError> {
        self.subtree_keys(root)
    }

    fn structural_hash(&self, root: &Address, excluded: &[String]) -> Result<u64, KorError> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for addr in self.subtree_keys(root)? {
            if is_excluded(root, &addr, excluded) {
                continue;
            }
            if let Some(node) = self.read_node(&addr)? {
                pairs.push((addr.to_string(), node.meta.joined_types()));
            }
        }
        pairs.sort();
        Ok(fold_structural_hash(
            pairs.iter().map(|(a, t)| (a.as_str(), t.clone())),
        ))
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        // Drain pending writes before the handle goes away.
        let _ = self.db.flush();
    }
}
