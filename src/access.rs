//! Access-control evaluation.
//!
//! Pure functions only: the tree and locker call in here on every read and
//! write, so evaluation must stay side-effect free.

use crate::types::{AccessLevel, NodeMeta, WILDCARD_ID};

/// Evaluate the access level `identity` holds on a node.
pub fn access_level(meta: &NodeMeta, identity: &str) -> AccessLevel {
    let read = id_listed(&meta.reader_ids, identity);
    let write = id_listed(&meta.writer_ids, identity);
    match (read, write) {
        (true, true) => AccessLevel::ReadWrite,
        (true, false) => AccessLevel::ReadOnly,
        (false, true) => AccessLevel::WriteOnly,
        (false, false) => AccessLevel::None,
    }
}

fn id_listed(ids: &[String], identity: &str) -> bool {
    ids.iter().any(|id| id == identity || id == WILDCARD_ID)
}

/// Normalize an identity list at node creation: the creator is prepended
/// so it can never lose access, and the system identity is appended unless
/// a wildcard already grants everyone.
pub fn normalize_ids(ids: &[String], creator: &str, system_id: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(ids.len() + 2);
    out.push(creator.to_string());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    let has_wildcard = out.iter().any(|id| id == WILDCARD_ID);
    if !has_wildcard && !out.iter().any(|id| id == system_id) {
        out.push(system_id.to_string());
    }
    out
}
