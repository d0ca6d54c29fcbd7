//! Storage backends.
//!
//! The core is storage-engine-agnostic: everything above this module talks
//! to [`StorageBackend`], a narrow keyed-by-address contract. Two backends
//! ship with the crate: an in-memory arena and a sled-backed store.

pub mod memory;
pub mod persistence;

use crate::address::Address;
use crate::error::KorError;
use crate::types::{InfoScope, NodeMeta, NodeRecord, ReadParams, NEVER_SET};
use std::collections::BTreeMap;

pub use memory::MemoryBackend;
pub use persistence::SledBackend;

/// Seed of the structural-hash fold; an empty subtree hashes to this.
pub const HASH_SEED: u64 = 17;

/// Odd prime folded in per hash component.
pub const HASH_PRIME: u64 = 31;

/// Pluggable key/value/version store keyed by address.
///
/// Implementations must make [`set_values`](StorageBackend::set_values)
/// one atomic unit: the whole batch lands at one extended timestamp with
/// all version bumps applied, or nothing lands at all.
pub trait StorageBackend: Send + Sync {
    /// Store a new structural node. The caller has already verified the
    /// parent exists and the address is free.
    fn add_node(&self, address: &Address, meta: NodeMeta) -> Result<(), KorError>;

    fn node_exists(&self, address: &Address) -> Result<bool, KorError>;

    /// Metadata of one address, or of its whole subtree.
    fn get_metadata(
        &self,
        address: &Address,
        include_subtree: bool,
    ) -> Result<BTreeMap<Address, NodeMeta>, KorError>;

    /// Records under `address` selected by `params.depth`, fields filtered
    /// by `params.scope`, value taken from the archive when
    /// `params.version` names a superseded version.
    fn get_record(
        &self,
        address: &Address,
        params: &ReadParams,
    ) -> Result<BTreeMap<Address, NodeRecord>, KorError>;

    /// Remove a node and its entire subtree, archived versions included.
    fn remove_node(&self, address: &Address) -> Result<(), KorError>;

    /// Atomically write a batch of values: one extended timestamp for the
    /// whole batch, the previous value of each address archived, and the
    /// version of each written address plus every ancestor below the
    /// agent root incremented. Returns the batch timestamp.
    fn set_values(&self, values: &BTreeMap<Address, String>) -> Result<f64, KorError>;

    /// All addresses inside the subtree rooted at `root`, sorted.
    fn addresses_under(&self, root: &Address) -> Result<Vec<Address>, KorError>;

    /// Deterministic structural hash of the subtree at `root`, skipping
    /// any address under the named direct-child subtrees.
    fn structural_hash(&self, root: &Address, excluded: &[String]) -> Result<u64, KorError>;
}

/// Fold sorted `(address, joined types)` pairs into the structural hash.
///
/// Order-sensitive on purpose: callers sort the pairs lexicographically by
/// address first, so identical trees always hash identically.
pub fn fold_structural_hash<'a, I>(pairs: I) -> u64
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut acc = HASH_SEED;
    for (address, types) in pairs {
        acc = acc.wrapping_mul(HASH_PRIME).wrapping_add(str_hash(address));
        acc = acc.wrapping_mul(HASH_PRIME).wrapping_add(str_hash(&types));
    }
    acc
}

fn str_hash(s: &str) -> u64 {
    s.bytes()
        .fold(0u64, |h, b| h.wrapping_mul(HASH_PRIME).wrapping_add(u64::from(b)))
}

/// Whether `address` inside the subtree at `root` falls under one of the
/// excluded direct-child subtree names.
pub(crate) fn is_excluded(root: &Address, address: &Address, excluded: &[String]) -> bool {
    excluded.iter().any(|name| {
        root.join(name)
            .map(|sub| sub.contains(address))
            .unwrap_or(false)
    })
}

/// Version-bump tally for a value batch: every written address counts
/// itself plus each ancestor strictly below its agent root.
pub(crate) fn version_bumps(values: &BTreeMap<Address, String>) -> BTreeMap<Address, i64> {
    let mut bumps: BTreeMap<Address, i64> = BTreeMap::new();
    for address in values.keys() {
        *bumps.entry(address.clone()).or_insert(0) += 1;
        for ancestor in address.ancestors() {
            if ancestor.depth() >= 2 {
                *bumps.entry(ancestor).or_insert(0) += 1;
            }
        }
    }
    bumps
}

/// Blank record fields the requested scope does not cover.
pub(crate) fn apply_scope(record: NodeRecord, scope: InfoScope) -> NodeRecord {
    match scope {
        InfoScope::Complete => record,
        InfoScope::Value => NodeRecord {
            meta: NodeMeta::new(Vec::new()),
            value: record.value,
            version: record.version,
            timestamp: record.timestamp,
        },
        InfoScope::Metadata => NodeRecord {
            meta: record.meta,
            value: None,
            version: NEVER_SET,
            timestamp: 0.0,
        },
    }
}

/// Which addresses of a subtree a read depth selects, root included.
pub(crate) fn depth_selects(
    root: &Address,
    address: &Address,
    depth: i32,
) -> Result<bool, KorError> {
    if address == root {
        return Ok(true);
    }
    match depth {
        0 => Ok(false),
        -1 => Ok(root.contains(address)),
        n if n > 0 => Ok(root.subtree_matcher(n as usize)?.is_match(address.as_str())),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fold_yields_seed() {
        assert_eq!(fold_structural_hash(std::iter::empty()), HASH_SEED);
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        let a = fold_structural_hash(vec![("/a", "t1".to_string()), ("/b", "t2".to_string())]);
        let b = fold_structural_hash(vec![("/b", "t2".to_string()), ("/a", "t1".to_string())]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fold_depends_on_types() {
        let a = fold_structural_hash(vec![("/a", "t1".to_string())]);
        let b = fold_structural_hash(vec![("/a", "t2".to_string())]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_bumps_stop_below_agent_root() {
        let mut values = BTreeMap::new();
        values.insert(Address::parse("/agent/svc/a/b").unwrap(), "x".to_string());
        let bumps = version_bumps(&values);
        assert_eq!(bumps.get(&Address::parse("/agent/svc/a/b").unwrap()), Some(&1));
        assert_eq!(bumps.get(&Address::parse("/agent/svc/a").unwrap()), Some(&1));
        assert_eq!(bumps.get(&Address::parse("/agent/svc").unwrap()), Some(&1));
        assert_eq!(bumps.get(&Address::parse("/agent").unwrap()), None);
    }

    #[test]
    fn test_version_bumps_accumulate_per_written_address() {
        let mut values = BTreeMap::new();
        values.insert(Address::parse("/agent/svc/a").unwrap(), "x".to_string());
        values.insert(Address::parse("/agent/svc/b").unwrap(), "y".to_string());
        let bumps = version_bumps(&values);
        assert_eq!(bumps.get(&Address::parse("/agent/svc").unwrap()), Some(&2));
    }
}
