//! Wire payloads exchanged between agents.
//!
//! Every payload is a variant of one tagged enum so the transport can
//! (de)serialize on an explicit discriminant instead of guessing types.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Value-less snapshot of a node's structure: metadata plus declared
/// children, keyed by relative child name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureNode {
    pub types: Vec<String>,
    pub reader_ids: Vec<String>,
    pub writer_ids: Vec<String>,
    pub restriction: String,
    pub cache_hint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, StructureNode>,
}

/// Structural diff between two checkpoint hashes of one agent's subtree.
///
/// An empty `hash_from` marks a full update: `added_nodes` then carries
/// the agent's entire subtree and `removed_nodes` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KorUpdate {
    pub hash_from: String,
    pub hash_to: String,
    pub added_nodes: BTreeMap<Address, StructureNode>,
    pub removed_nodes: BTreeSet<Address>,
    pub agent_name: String,
}

impl KorUpdate {
    pub fn is_full(&self) -> bool {
        self.hash_from.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty() && self.removed_nodes.is_empty()
    }
}

/// One agent's entry in a handshake: who it is, where its subtree stands,
/// and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSummary {
    pub agent_id: String,
    pub structural_hash: String,
    pub endpoints: Vec<String>,
}

/// The tagged message family carried by the external transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum KorMessage {
    /// Bidirectional pre-sync exchange of per-agent summaries, optionally
    /// carrying fresh group key material.
    Handshake {
        summaries: Vec<HandshakeSummary>,
        group_key: Option<String>,
    },
    /// A structural diff to apply.
    Update(KorUpdate),
    /// Standalone agent announcement.
    AgentInfo {
        agent_id: String,
        endpoints: Vec<String>,
    },
    /// Liveness probe.
    AlivePing { agent_id: String },
    /// Endpoint offer used to (re)establish a transport connection.
    TransportConnector {
        agent_id: String,
        endpoint: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> KorUpdate {
        let mut added = BTreeMap::new();
        added.insert(
            Address::parse("/b/svc").unwrap(),
            StructureNode {
                types: vec!["/service".to_string()],
                reader_ids: vec!["b".to_string(), "*".to_string()],
                writer_ids: vec!["b".to_string()],
                restriction: String::new(),
                cache_hint: String::new(),
                children: BTreeMap::new(),
            },
        );
        let mut removed = BTreeSet::new();
        removed.insert(Address::parse("/b/old").unwrap());
        KorUpdate {
            hash_from: "00000000000000aa".to_string(),
            hash_to: "00000000000000bb".to_string(),
            added_nodes: added,
            removed_nodes: removed,
            agent_name: "b".to_string(),
        }
    }

    #[test]
    fn test_update_round_trip() {
        let msg = KorMessage::Update(sample_update());
        let json = serde_json::to_string(&msg).unwrap();
        let back: KorMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_messages_carry_discriminant() {
        let ping = KorMessage::AlivePing { agent_id: "a".to_string() };
        let json = serde_json::to_string(&ping).unwrap();
        assert!(json.contains("\"kind\":\"AlivePing\""));

        let handshake = KorMessage::Handshake { summaries: vec![], group_key: None };
        let json = serde_json::to_string(&handshake).unwrap();
        assert!(json.contains("\"kind\":\"Handshake\""));
    }

    #[test]
    fn test_full_update_detection() {
        let mut update = sample_update();
        assert!(!update.is_full());
        update.hash_from.clear();
        assert!(update.is_full());
    }
}
