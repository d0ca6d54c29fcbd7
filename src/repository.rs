//! The knowledge repository: request surface of one agent's KOR.
//!
//! Composes the addressed tree, the subtree locker and the sync state.
//! Requests come in here, get access-checked and routed; structural
//! mutations are checkpointed and, when a sink is registered, pushed to
//! peers as incremental updates.

use crate::address::Address;
use crate::config::KorConfig;
use crate::error::KorError;
use crate::lock::{LockHandler, SubtreeLocker};
use crate::storage::StorageBackend;
use crate::sync::{format_hash, HandshakeSummary, KorUpdate, SyncState};
use crate::tree::{NodeTree, WriteOutcome};
use crate::types::{NodeData, ReadParams};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

/// Type tag carried by agent root nodes.
const AGENT_TYPE: &str = "/core/agent";

/// Type tag carried by the internal system subtree.
const SYSTEM_TYPE: &str = "/core/system";

/// Receives incremental updates produced by local structural changes.
/// Delivery to peers is the transport's concern.
pub trait UpdateSink: Send + Sync {
    fn push_update(&self, update: &KorUpdate);
}

/// Notified after value writes reach storage (directly or via commit).
/// Subscription bookkeeping and delivery are external.
pub trait SubscriptionHook: Send + Sync {
    fn values_committed(&self, addresses: &[Address]);
}

/// What a handshake tells us to do about one remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullPlan {
    /// Our replica hash matches the remote's current hash.
    UpToDate,
    /// Ask the remote for changes since this hash.
    Incremental(String),
    /// No usable replica state; request everything.
    Full,
}

/// One agent's Knowledge Object Register.
pub struct KnowledgeRepository {
    backend: Arc<dyn StorageBackend>,
    locker: Arc<SubtreeLocker>,
    tree: NodeTree,
    sync: Mutex<SyncState>,
    agent_root: Address,
    sink: RwLock<Option<Arc<dyn UpdateSink>>>,
    subscriptions: RwLock<Option<Arc<dyn SubscriptionHook>>>,
}

impl KnowledgeRepository {
    /// Assemble a repository over `backend`, creating the agent root and
    /// its internal subtree when absent.
    pub fn new(backend: Arc<dyn StorageBackend>, config: &KorConfig) -> Result<Self, KorError> {
        let agent_root = Address::root().join(&config.agent_name)?;
        let locker = Arc::new(SubtreeLocker::with_warn_ahead(
            config.lock.timeout(),
            config.lock.warn_ahead(),
        ));
        let tree = NodeTree::new(backend.clone(), locker.clone(), &config.system_identity);

        if !backend.node_exists(&agent_root)? {
            tree.add_node(
                &agent_root,
                vec![AGENT_TYPE.to_string()],
                vec!["*".to_string()],
                Vec::new(),
                String::new(),
                String::new(),
                &config.agent_name,
            )?;
        }
        let internal = agent_root.join(&config.internal_subtree)?;
        if !backend.node_exists(&internal)? {
            tree.add_node(
                &internal,
                vec![SYSTEM_TYPE.to_string()],
                Vec::new(),
                Vec::new(),
                String::new(),
                String::new(),
                &config.agent_name,
            )?;
        }

        let sync = SyncState::new(
            config.agent_name.clone(),
            agent_root.clone(),
            vec![config.internal_subtree.clone()],
            backend.as_ref(),
        )?;
        info!(agent = %config.agent_name, hash = %format_hash(sync.current_hash()), "repository ready");
        Ok(KnowledgeRepository {
            backend,
            locker,
            tree,
            sync: Mutex::new(sync),
            agent_root,
            sink: RwLock::new(None),
            subscriptions: RwLock::new(None),
        })
    }

    pub fn agent_root(&self) -> &Address {
        &self.agent_root
    }

    /// Current structural checkpoint, as carried in handshakes.
    pub fn current_hash(&self) -> String {
        format_hash(self.sync.lock().current_hash())
    }

    /// Register the sink incremental updates are pushed into.
    pub fn register_update_sink(&self, sink: Arc<dyn UpdateSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Register the hook notified after committed value writes.
    pub fn register_subscription_hook(&self, hook: Arc<dyn SubscriptionHook>) {
        *self.subscriptions.write() = Some(hook);
    }

    /// Read a node or subtree as `identity`.
    pub fn get(
        &self,
        address: &Address,
        params: &ReadParams,
        identity: &str,
    ) -> Result<NodeData, KorError> {
        self.tree.get(address, params, identity)
    }

    /// Write values under a locally owned address as `identity`.
    ///
    /// Remote-owned addresses are rejected: a remote replica is a cached
    /// snapshot, never a write target.
    pub fn set_value(
        &self,
        address: &Address,
        identity: &str,
        data: &NodeData,
    ) -> Result<Vec<Address>, KorError> {
        self.require_local(address, identity)?;
        let outcome = self.tree.set_value(address, identity, data)?;
        if let WriteOutcome::Written(addresses) = &outcome {
            self.notify_committed(addresses);
        }
        Ok(outcome.addresses().to_vec())
    }

    /// Create a node under the local subtree.
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
        self.require_local(address, creator)?;
        let update = {
            let mut sync = self.sync.lock();
            self.tree.add_node(
                address,
                types,
                reader_ids,
                writer_ids,
                restriction,
                cache_hint,
                creator,
            )?;
            let (pre, post) = sync.record_change(self.backend.as_ref(), address)?;
            self.pending_push(&sync, pre, post)
        };
        self.push(update);
        Ok(())
    }

    /// Remove a node (and its subtree) from the local subtree.
    pub fn remove_node(&self, address: &Address, identity: &str) -> Result<(), KorError> {
        self.require_local(address, identity)?;
        let data = self.tree.get(address, &ReadParams::node(), identity)?;
        if !data.access.can_write() {
            return Err(KorError::NoPermission {
                address: address.to_string(),
                identity: identity.to_string(),
            });
        }
        let update = {
            let mut sync = self.sync.lock();
            self.backend.remove_node(address)?;
            let (pre, post) = sync.record_change(self.backend.as_ref(), address)?;
            self.pending_push(&sync, pre, post)
        };
        self.push(update);
        Ok(())
    }

    /// Take an exclusive staged-write lock on a local subtree.
    pub fn lock_subtree(
        &self,
        address: &Address,
        identity: &str,
        handler: Arc<dyn LockHandler>,
    ) -> Result<(), KorError> {
        self.require_local(address, identity)?;
        let access_ids = self.tree.accessor_ids(address)?;
        self.locker.lock_subtree(address, identity, access_ids, handler)
    }

    /// Apply a lock's staged writes through the normal write path, then
    /// release the lock.
    pub fn commit_subtree(&self, address: &Address, identity: &str) -> Result<(), KorError> {
        let mut committed: Vec<Address> = Vec::new();
        self.locker.commit_subtree(address, identity, |staged| {
            self.tree.apply_staged(staged)?;
            committed = staged.keys().cloned().collect();
            Ok(())
        })?;
        self.notify_committed(&committed);
        Ok(())
    }

    /// Discard a lock's staged writes and release it.
    pub fn rollback_subtree(&self, address: &Address, identity: &str) -> Result<(), KorError> {
        self.locker.rollback_subtree(address, identity)
    }

    /// Build the update a peer holding `from` needs. An empty or unknown
    /// `from` (or the full-sync sentinel) yields a full update.
    pub fn update_from_hash(&self, from: &str) -> Result<KorUpdate, KorError> {
        self.sync.lock().update_from_hash(self.backend.as_ref(), from)
    }

    /// Apply a remote agent's update to the local replica of its subtree.
    pub fn apply_update(&self, update: &KorUpdate) -> Result<(), KorError> {
        let sync = self.sync.lock();
        if update.agent_name == sync.agent_name() {
            warn!(agent = %update.agent_name, "ignoring update that claims local origin");
            return Ok(());
        }
        sync.apply_update(&self.tree, update)
    }

    /// This agent's handshake entry.
    pub fn summary(&self, endpoints: Vec<String>) -> HandshakeSummary {
        let sync = self.sync.lock();
        HandshakeSummary {
            agent_id: sync.agent_name().to_string(),
            structural_hash: format_hash(sync.current_hash()),
            endpoints,
        }
    }

    /// Decide how to catch up with a remote agent after a handshake,
    /// given the hash our replica of it was last synced to.
    pub fn plan_pull(remote: &HandshakeSummary, last_synced: Option<&str>) -> PullPlan {
        match last_synced {
            Some(hash) if hash == remote.structural_hash => PullPlan::UpToDate,
            Some(hash) => PullPlan::Incremental(hash.to_string()),
            None => PullPlan::Full,
        }
    }

    fn require_local(&self, address: &Address, identity: &str) -> Result<(), KorError> {
        if self.agent_root.contains(address) {
            Ok(())
        } else {
            Err(KorError::NoPermission {
                address: address.to_string(),
                identity: identity.to_string(),
            })
        }
    }

    /// Build the auto-push update for a structural change, while still
    /// holding the sync lock. Full updates are never auto-pushed.
    fn pending_push(&self, sync: &SyncState, pre: u64, post: u64) -> Option<KorUpdate> {
        if pre == post {
            return None;
        }
        if self.sink.read().is_none() {
            return None;
        }
        match sync.update_from_hash(self.backend.as_ref(), &format_hash(pre)) {
            Ok(update) if update.is_full() => None,
            Ok(update) if update.is_empty() => None,
            Ok(update) => Some(update),
            Err(e) => {
                warn!(error = %e, "failed to build incremental update for push");
                None
            }
        }
    }

    fn push(&self, update: Option<KorUpdate>) {
        if let Some(update) = update {
            if let Some(sink) = self.sink.read().clone() {
                sink.push_update(&update);
            }
        }
    }

    fn notify_committed(&self, addresses: &[Address]) {
        if addresses.is_empty() {
            return;
        }
        if let Some(hook) = self.subscriptions.read().clone() {
            hook.values_committed(addresses);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KorConfig;
    use crate::lock::SilentLockHandler;
    use crate::storage::MemoryBackend;
    use crate::types::NEVER_SET;
    use parking_lot::Mutex as PlMutex;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn repo(agent: &str) -> KnowledgeRepository {
        let mut config = KorConfig::default();
        config.agent_name = agent.to_string();
        KnowledgeRepository::new(Arc::new(MemoryBackend::new()), &config).unwrap()
    }

    struct RecordingSink {
        updates: PlMutex<Vec<KorUpdate>>,
    }

    impl UpdateSink for RecordingSink {
        fn push_update(&self, update: &KorUpdate) {
            self.updates.lock().push(update.clone());
        }
    }

    struct RecordingHook {
        committed: PlMutex<Vec<Address>>,
    }

    impl SubscriptionHook for RecordingHook {
        fn values_committed(&self, addresses: &[Address]) {
            self.committed.lock().extend(addresses.iter().cloned());
        }
    }

    #[test]
    fn test_new_creates_agent_root_and_internal_subtree() {
        let repo = repo("a");
        assert!(repo.backend.node_exists(&addr("/a")).unwrap());
        assert!(repo.backend.node_exists(&addr("/a/system")).unwrap());
    }

    #[test]
    fn test_remote_write_rejected() {
        let repo = repo("a");
        let data = NodeData::with_value(addr("/b/x"), "nope");
        assert!(matches!(
            repo.set_value(&addr("/b/x"), "a", &data),
            Err(KorError::NoPermission { .. })
        ));
    }

    #[test]
    fn test_full_update_lists_local_subtree_without_internal() {
        let repo = repo("a");
        repo.add_node(&addr("/a/svc"), vec!["/service".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();
        repo.add_node(&addr("/a/svc/n"), vec!["/basic/text".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();

        let update = repo.update_from_hash("").unwrap();
        assert!(update.is_full());
        let added: Vec<String> = update.added_nodes.keys().map(|a| a.to_string()).collect();
        assert_eq!(added, vec!["/a", "/a/svc", "/a/svc/n"]);
        assert!(update.removed_nodes.is_empty());
        assert_eq!(update.hash_to, repo.current_hash());
    }

    #[test]
    fn test_incremental_update_minimality() {
        let repo = repo("a");
        for name in ["one", "two", "three"] {
            repo.add_node(&addr(&format!("/a/{}", name)), vec!["/basic/text".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();
        }
        let checkpoint = repo.current_hash();

        repo.add_node(&addr("/a/four"), vec!["/basic/text".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();
        repo.remove_node(&addr("/a/one"), "a").unwrap();
        repo.remove_node(&addr("/a/two"), "a").unwrap();

        let update = repo.update_from_hash(&checkpoint).unwrap();
        assert!(!update.is_full());
        assert_eq!(update.added_nodes.len(), 1);
        assert!(update.added_nodes.contains_key(&addr("/a/four")));
        assert_eq!(update.removed_nodes.len(), 2);
        assert!(update.removed_nodes.contains(&addr("/a/one")));
        assert!(update.removed_nodes.contains(&addr("/a/two")));
        assert_eq!(update.hash_to, repo.current_hash());
    }

    #[test]
    fn test_apply_update_builds_remote_replica() {
        let source = repo("b");
        source.add_node(&addr("/b/svc"), vec!["/service".into()], vec!["*".into()], vec![], String::new(), String::new(), "b").unwrap();
        let update = source.update_from_hash("").unwrap();

        let target = repo("a");
        target.apply_update(&update).unwrap();
        assert!(target.backend.node_exists(&addr("/b")).unwrap());
        assert!(target.backend.node_exists(&addr("/b/svc")).unwrap());
        // The internal subtree never crosses agents.
        assert!(!target.backend.node_exists(&addr("/b/system")).unwrap());
    }

    #[test]
    fn test_apply_update_never_touches_local_subtree() {
        let repo_a = repo("a");
        repo_a.add_node(&addr("/a/svc"), vec!["/service".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();

        let mut update = repo_a.update_from_hash("").unwrap();
        update.agent_name = "mallory".to_string();
        update.removed_nodes.insert(addr("/a/svc"));
        repo_a.apply_update(&update).unwrap();
        assert!(repo_a.backend.node_exists(&addr("/a/svc")).unwrap());
    }

    #[test]
    fn test_structural_changes_push_incremental_updates() {
        let repo = repo("a");
        let sink = Arc::new(RecordingSink { updates: PlMutex::new(Vec::new()) });
        repo.register_update_sink(sink.clone());

        repo.add_node(&addr("/a/svc"), vec!["/service".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();
        repo.remove_node(&addr("/a/svc"), "a").unwrap();

        let updates = sink.updates.lock();
        assert_eq!(updates.len(), 2);
        assert!(!updates[0].is_full());
        assert!(updates[0].added_nodes.contains_key(&addr("/a/svc")));
        assert!(updates[1].removed_nodes.contains(&addr("/a/svc")));
    }

    #[test]
    fn test_internal_subtree_changes_are_not_pushed() {
        let repo = repo("a");
        let sink = Arc::new(RecordingSink { updates: PlMutex::new(Vec::new()) });
        repo.register_update_sink(sink.clone());

        repo.add_node(&addr("/a/system/secret"), vec!["/basic/text".into()], vec![], vec![], String::new(), String::new(), "a").unwrap();
        assert!(sink.updates.lock().is_empty());
    }

    #[test]
    fn test_lock_commit_applies_and_notifies() {
        let repo = repo("a");
        let hook = Arc::new(RecordingHook { committed: PlMutex::new(Vec::new()) });
        repo.register_subscription_hook(hook.clone());
        repo.add_node(&addr("/a/svc"), vec!["/service".into()], vec!["*".into()], vec!["a".into()], String::new(), String::new(), "a").unwrap();
        repo.add_node(&addr("/a/svc/n"), vec!["/basic/text".into()], vec!["*".into()], vec!["a".into()], String::new(), String::new(), "a").unwrap();

        repo.lock_subtree(&addr("/a/svc"), "a", Arc::new(SilentLockHandler)).unwrap();
        let data = NodeData::with_value(addr("/a/svc/n"), "staged");
        repo.set_value(&addr("/a/svc/n"), "a", &data).unwrap();

        // Staged: not visible, no notification yet.
        let read = repo.get(&addr("/a/svc/n"), &ReadParams::node(), "a").unwrap();
        assert_eq!(read.value, None);
        assert!(hook.committed.lock().is_empty());

        repo.commit_subtree(&addr("/a/svc"), "a").unwrap();
        let read = repo.get(&addr("/a/svc/n"), &ReadParams::node(), "a").unwrap();
        assert_eq!(read.value.as_deref(), Some("staged"));
        assert_eq!(hook.committed.lock().as_slice(), &[addr("/a/svc/n")]);
    }

    #[test]
    fn test_rollback_leaves_value_unchanged() {
        let repo = repo("a");
        repo.add_node(&addr("/a/n"), vec!["/basic/text".into()], vec!["*".into()], vec!["a".into()], String::new(), String::new(), "a").unwrap();
        let data = NodeData::with_value(addr("/a/n"), "original");
        repo.set_value(&addr("/a/n"), "a", &data).unwrap();

        repo.lock_subtree(&addr("/a/n"), "a", Arc::new(SilentLockHandler)).unwrap();
        let data = NodeData::with_value(addr("/a/n"), "pending");
        repo.set_value(&addr("/a/n"), "a", &data).unwrap();
        repo.rollback_subtree(&addr("/a/n"), "a").unwrap();

        let read = repo.get(&addr("/a/n"), &ReadParams::node(), "a").unwrap();
        assert_eq!(read.value.as_deref(), Some("original"));
        assert_eq!(read.version, 0);
    }

    #[test]
    fn test_plan_pull() {
        let remote = HandshakeSummary {
            agent_id: "b".to_string(),
            structural_hash: "0011".to_string(),
            endpoints: vec![],
        };
        assert_eq!(KnowledgeRepository::plan_pull(&remote, Some("0011")), PullPlan::UpToDate);
        assert_eq!(
            KnowledgeRepository::plan_pull(&remote, Some("dead")),
            PullPlan::Incremental("dead".to_string())
        );
        assert_eq!(KnowledgeRepository::plan_pull(&remote, None), PullPlan::Full);
    }

    #[test]
    fn test_version_never_set_surfaces_as_minus_one() {
        let repo = repo("a");
        repo.add_node(&addr("/a/n"), vec!["/basic/text".into()], vec!["*".into()], vec![], String::new(), String::new(), "a").unwrap();
        let read = repo.get(&addr("/a/n"), &ReadParams::node(), "a").unwrap();
        assert_eq!(read.version, NEVER_SET);
    }
}
