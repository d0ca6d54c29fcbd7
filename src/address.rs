//! Absolute slash-delimited addresses and the path arithmetic built on them.
//!
//! Addresses are the only way nodes refer to each other: parent/child
//! relationships are always recomputed from the path string, never stored
//! as back-pointers that could go stale.

use crate::error::KorError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An absolute address in the global KOR tree, e.g. `/agent1/serviceX/child`.
///
/// Always starts with `/`; no trailing slash except the root `/` itself;
/// no empty segments. Ordering is plain lexicographic string order, which
/// sorts every parent before its children.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The tree root `/`.
    pub fn root() -> Self {
        Address("/".to_string())
    }

    /// Parse and validate an absolute address string.
    pub fn parse(raw: &str) -> Result<Self, KorError> {
        if raw == "/" {
            return Ok(Self::root());
        }
        if !raw.starts_with('/') || raw.ends_with('/') {
            return Err(KorError::InvalidAddress(raw.to_string()));
        }
        if raw[1..].split('/').any(|seg| seg.is_empty()) {
            return Err(KorError::InvalidAddress(raw.to_string()));
        }
        Ok(Address(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, root yields none.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Structural parent (strip the last segment); `None` for the root.
    pub fn parent(&self) -> Option<Address> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Address(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last path segment; `None` for the root.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments().last()
    }

    /// The agent root: the address formed by the first segment.
    ///
    /// Version propagation stops below this address, and sync ownership is
    /// decided by it.
    pub fn agent_root(&self) -> Option<Address> {
        let first = self.segments().next()?;
        Some(Address(format!("/{}", first)))
    }

    /// The service boundary: the address formed by the first two segments.
    pub fn service_root(&self) -> Option<Address> {
        let mut segs = self.segments();
        let agent = segs.next()?;
        let service = segs.next()?;
        Some(Address(format!("/{}/{}", agent, service)))
    }

    /// Child address extended by one segment.
    pub fn join(&self, name: &str) -> Result<Address, KorError> {
        if name.is_empty() || name.contains('/') {
            return Err(KorError::InvalidAddress(format!("{}/{}", self.0, name)));
        }
        if self.is_root() {
            Ok(Address(format!("/{}", name)))
        } else {
            Ok(Address(format!("{}/{}", self.0, name)))
        }
    }

    /// Path-aware prefix test: `/a` contains `/a` and `/a/b`, not `/ab`.
    pub fn contains(&self, other: &Address) -> bool {
        if self.is_root() {
            return true;
        }
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes()[self.0.len()] == b'/')
    }

    /// Strict ancestor test: `contains` minus equality.
    pub fn is_ancestor_of(&self, other: &Address) -> bool {
        self.0 != other.0 && self.contains(other)
    }

    /// All strict ancestors from the parent up to (excluding) the root.
    pub fn ancestors(&self) -> Vec<Address> {
        let mut out = Vec::new();
        let mut cursor = self.parent();
        while let Some(addr) = cursor {
            if addr.is_root() {
                break;
            }
            cursor = addr.parent();
            out.push(addr);
        }
        out
    }

    /// Regex matching descendants exactly `extra` segments below this
    /// address. Used to implement bounded-depth subtree reads.
    pub fn subtree_matcher(&self, extra: usize) -> Result<Regex, KorError> {
        let base = regex::escape(if self.is_root() { "" } else { &self.0 });
        let pattern = format!("^{}(/[^/]+){{1,{}}}$", base, extra.max(1));
        Regex::new(&pattern).map_err(|e| KorError::InvalidAddress(e.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
