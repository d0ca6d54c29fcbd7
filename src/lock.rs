//! Subtree locking with staged writes.
//!
//! A lock claims one address and everything below it. Writes into a locked
//! subtree by the lock's participants are staged inside the lock and only
//! reach storage on commit; rollback and expiry discard them. Acquisition
//! on a held address fails synchronously, there is no blocking wait.

use crate::address::Address;
use crate::error::KorError;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Callbacks a lock holder registers for lifecycle notifications.
///
/// Invoked from the locker's sweeper thread (expiry) or the acquiring
/// thread (acquisition); implementations must not call back into the
/// locker from `lock_expired`.
pub trait LockHandler: Send + Sync {
    fn lock_acquired(&self, _address: &Address) {}
    fn lock_will_expire(&self, _address: &Address) {}
    fn lock_expired(&self, _address: &Address) {}
}

/// Handler for callers that do not care about notifications.
pub struct SilentLockHandler;

impl LockHandler for SilentLockHandler {}

struct LockEntry {
    owner: String,
    access_ids: Vec<String>,
    staged: BTreeMap<Address, String>,
    deadline: Instant,
    warned: bool,
    handler: Arc<dyn LockHandler>,
}

struct LockerShared {
    locks: Mutex<BTreeMap<Address, LockEntry>>,
    changed: Condvar,
    shutdown: Mutex<bool>,
    warn_ahead: Duration,
}

/// Per-address exclusive lock table with expiry sweeping.
pub struct SubtreeLocker {
    shared: Arc<LockerShared>,
    timeout: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl SubtreeLocker {
    /// Default lock lifetime when no explicit timeout is configured.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Interval before the deadline at which `lock_will_expire` fires.
    pub const DEFAULT_WARN_AHEAD: Duration = Duration::from_secs(2);

    pub fn new(timeout: Duration) -> Self {
        Self::with_warn_ahead(timeout, Self::DEFAULT_WARN_AHEAD)
    }

    pub fn with_warn_ahead(timeout: Duration, warn_ahead: Duration) -> Self {
        let shared = Arc::new(LockerShared {
            locks: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            shutdown: Mutex::new(false),
            warn_ahead: warn_ahead.min(timeout),
        });
        let sweeper_shared = shared.clone();
        let sweeper = thread::Builder::new()
            .name("kor-lock-sweeper".to_string())
            .spawn(move || sweep_loop(sweeper_shared))
            .ok();
        SubtreeLocker { shared, timeout, sweeper }
    }

    /// Acquire an exclusive lock on `address` and its subtree.
    ///
    /// Fails with `AlreadyLocked` when any active lock overlaps the
    /// requested subtree, whatever its owner. `access_ids` is the set of
    /// identities allowed to stage writes inside the lock (typically the
    /// union of the node's readers and writers).
    pub fn lock_subtree(
        &self,
        address: &Address,
        identity: &str,
        access_ids: Vec<String>,
        handler: Arc<dyn LockHandler>,
    ) -> Result<(), KorError> {
        {
            let mut locks = self.shared.locks.lock();
            let conflict = locks
                .keys()
                .any(|held| held.contains(address) || address.contains(held));
            if conflict {
                return Err(KorError::AlreadyLocked(address.to_string()));
            }
            locks.insert(
                address.clone(),
                LockEntry {
                    owner: identity.to_string(),
                    access_ids,
                    staged: BTreeMap::new(),
                    deadline: Instant::now() + self.timeout,
                    warned: false,
                    handler: handler.clone(),
                },
            );
            self.shared.changed.notify_all();
        }
        debug!(address = %address, identity, "subtree locked");
        handler.lock_acquired(address);
        Ok(())
    }

    /// Commit the lock at `address`: run `apply` over the staged writes
    /// and release the lock only when it succeeds. On failure the lock and
    /// its staged pairs stay in place, so the owner can retry or roll back.
    pub fn commit_subtree<F>(
        &self,
        address: &Address,
        identity: &str,
        apply: F,
    ) -> Result<(), KorError>
    where
        F: FnOnce(&BTreeMap<Address, String>) -> Result<(), KorError>,
    {
        let mut locks = self.shared.locks.lock();
        let entry = locks
            .get(address)
            .ok_or_else(|| KorError::NotLocked(address.to_string()))?;
        if entry.owner != identity {
            return Err(KorError::NoPermission {
                address: address.to_string(),
                identity: identity.to_string(),
            });
        }
        apply(&entry.staged)?;
        let staged = entry.staged.len();
        locks.remove(address);
        debug!(address = %address, staged, "subtree lock committed");
        Ok(())
    }

    /// Release the lock at `address`, discarding its staged writes.
    pub fn rollback_subtree(&self, address: &Address, identity: &str) -> Result<(), KorError> {
        let mut locks = self.shared.locks.lock();
        let entry = locks
            .get(address)
            .ok_or_else(|| KorError::NotLocked(address.to_string()))?;
        if entry.owner != identity {
            return Err(KorError::NoPermission {
                address: address.to_string(),
                identity: identity.to_string(),
            });
        }
        locks.remove(address);
        debug!(address = %address, "subtree lock rolled back");
        Ok(())
    }

    /// Whether any active lock covers `address`.
    pub fn is_locked(&self, address: &Address) -> bool {
        self.shared
            .locks
            .lock()
            .keys()
            .any(|held| held.contains(address))
    }

    /// Whether the lock covering `address` is owned by `client`. This is
    /// the predicate the tree routes writes on: only the owner's writes
    /// are staged, everyone else is turned away.
    pub fn is_locked_by(&self, address: &Address, client: &str) -> bool {
        self.shared
            .locks
            .lock()
            .iter()
            .any(|(held, entry)| held.contains(address) && entry.owner == client)
    }

    /// Stage value writes into the lock covering `address`.
    pub fn stage(
        &self,
        address: &Address,
        client: &str,
        values: BTreeMap<Address, String>,
    ) -> Result<(), KorError> {
        let mut locks = self.shared.locks.lock();
        let entry = locks
            .iter_mut()
            .find(|(held, _)| held.contains(address))
            .map(|(_, entry)| entry)
            .ok_or_else(|| KorError::NotLocked(address.to_string()))?;
        if entry.owner != client && !entry.access_ids.iter().any(|id| id == client) {
            return Err(KorError::Locked(address.to_string()));
        }
        entry.staged.extend(values);
        Ok(())
    }

    /// Addresses of all active locks, for diagnostics.
    pub fn active_locks(&self) -> Vec<Address> {
        self.shared.locks.lock().keys().cloned().collect()
    }
}

impl Drop for SubtreeLocker {
    fn drop(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }
}

/// Sweeper: fires `lock_will_expire` one warn interval before each
/// deadline and `lock_expired` at the deadline, discarding staged writes.
fn sweep_loop(shared: Arc<LockerShared>) {
    loop {
        let mut due_warnings: Vec<(Address, Arc<dyn LockHandler>)> = Vec::new();
        let mut due_expiries: Vec<(Address, Arc<dyn LockHandler>)> = Vec::new();
        let wait_until;
        {
            let mut locks = shared.locks.lock();
            let now = Instant::now();
            let mut expired: Vec<Address> = Vec::new();
            for (address, entry) in locks.iter_mut() {
                if now >= entry.deadline {
                    expired.push(address.clone());
                } else if !entry.warned && now + shared.warn_ahead >= entry.deadline {
                    entry.warned = true;
                    due_warnings.push((address.clone(), entry.handler.clone()));
                }
            }
            for address in expired {
                if let Some(entry) = locks.remove(&address) {
                    warn!(address = %address, staged = entry.staged.len(), "subtree lock expired");
                    due_expiries.push((address, entry.handler));
                }
            }
            wait_until = locks
                .values()
                .map(|entry| {
                    if entry.warned {
                        entry.deadline
                    } else {
                        entry.deadline - shared.warn_ahead
                    }
                })
                .min();
        }
        for (address, handler) in due_warnings {
            handler.lock_will_expire(&address);
        }
        for (address, handler) in due_expiries {
            handler.lock_expired(&address);
        }

        let mut shutdown = shared.shutdown.lock();
        if *shutdown {
            return;
        }
        // Cap the wait so a lock registered in the notify race window is
        // still picked up on the next pass.
        let timeout = wait_until
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(500))
            .min(Duration::from_millis(500));
        shared
            .changed
            .wait_for(&mut shutdown, timeout.max(Duration::from_millis(1)));
        if *shutdown {
            return;
        }
    }
}
