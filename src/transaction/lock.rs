//! Distributed locks over the cluster store
//!
//! A lock is a record at `locks/<name>` attached to a lease. The holder
//! renews the lease in the background; if the holder dies the lease expires
//! and the record disappears, so a crashed owner's lock is reclaimed after at
//! most one TTL.
//!
//! Transactions take locks through a synthetic leading step (`txn.lock`) and
//! drop them in a trailing step (`txn.unlock`). `txn.unlock` is also the lock
//! step's undo, so rollback releases the lock only after every other undo ran.

use crate::common::store::{get_json, ClusterStore, LeaseId};
use crate::common::utils::{encode_key, timestamp_now_millis};
use crate::common::{Error, Result, TxnConfig};
use crate::transaction::context::TxnCtx;
use crate::transaction::registry::StepRegistry;
use crate::transaction::step::{NodeId, Step};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Store prefix of lock records
pub const LOCK_PREFIX: &str = "locks/";

/// Context key listing the resources a transaction locks
pub const LOCKS_KEY: &str = "_txn.locks";

pub const LOCK_STEP: &str = "txn.lock";
pub const UNLOCK_STEP: &str = "txn.unlock";

/// Upper bound between re-checks of a busy lock when no watch event arrives
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What the lock record says about its holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub token: Uuid,
    pub acquired_at: u64,
}

/// Ownership of one named lock
pub struct LockHandle {
    name: String,
    key: String,
    record: Vec<u8>,
    lease: LeaseId,
    store: Arc<dyn ClusterStore>,
    released: AtomicBool,
    lease_lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set once the heartbeat could not renew the lease
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Release the lock. Idempotent; a lost or expired lock is a no-op.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.heartbeat.abort();
        // Only delete the record if it is still ours
        let deleted = self.store.compare_and_delete(&self.key, &self.record)?;
        self.store.revoke_lease(self.lease)?;
        if deleted {
            tracing::debug!(lock = %self.name, "Released lock");
        } else {
            tracing::warn!(lock = %self.name, "Lock was no longer held at release");
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(lock = %self.name, error = %e, "Failed to release lock on drop");
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("lease", &self.lease)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Lease-backed mutual exclusion on resource names
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn ClusterStore>,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn ClusterStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, encode_key(name))
    }

    /// Current holder of `name`, if any
    pub fn holder(&self, name: &str) -> Result<Option<LockRecord>> {
        get_json(self.store.as_ref(), &Self::key(name))
    }

    /// Block until `name` is ours or `timeout` elapses
    ///
    /// A zero timeout is a try-lock. Locks are not re-entrant: asking again
    /// for a lock `owner` already holds is a conflict.
    pub async fn acquire(&self, name: &str, owner: &str, timeout: Duration) -> Result<LockHandle> {
        let key = Self::key(name);
        let deadline = Instant::now() + timeout;
        let mut watcher = self.store.watch(&key);
        let record = LockRecord {
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            acquired_at: timestamp_now_millis(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;

        loop {
            let lease = self.store.grant_lease(self.ttl)?;
            if self
                .store
                .compare_and_swap(&key, None, bytes.clone(), Some(lease))?
            {
                tracing::debug!(lock = name, owner, "Acquired lock");
                return Ok(self.handle(name, key, bytes, lease));
            }
            self.store.revoke_lease(lease)?;

            let holder = match self.holder(name)? {
                Some(h) => h,
                // Freed between the swap and the read
                None => continue,
            };
            if holder.owner == owner || timeout.is_zero() {
                return Err(Error::LockConflict {
                    name: name.to_string(),
                    holder: holder.owner,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(name.to_string()));
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..20));
            let wait = (deadline - now).min(POLL_INTERVAL + jitter);
            // Either a change on the key or the poll interval wakes us
            let _ = tokio::time::timeout(wait, watcher.next()).await;
        }
    }

    fn handle(&self, name: &str, key: String, record: Vec<u8>, lease: LeaseId) -> LockHandle {
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            name.to_string(),
            lease,
            self.ttl / 3,
            lease_lost.clone(),
        ));
        LockHandle {
            name: name.to_string(),
            key,
            record,
            lease,
            store: self.store.clone(),
            released: AtomicBool::new(false),
            lease_lost,
            heartbeat,
        }
    }
}

async fn heartbeat(
    store: Arc<dyn ClusterStore>,
    name: String,
    lease: LeaseId,
    every: Duration,
    lost: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(every).await;
        match store.keep_alive(lease) {
            Ok(true) => continue,
            Ok(false) => tracing::error!(lock = %name, "Lock lease expired before renewal"),
            Err(e) => tracing::error!(lock = %name, error = %e, "Failed to renew lock lease"),
        }
        lost.store(true, Ordering::SeqCst);
        return;
    }
}

/// Locks held by running transactions on this node
pub struct LockManager {
    lock: DistributedLock,
    timeout: Duration,
    held: Mutex<HashMap<Uuid, Vec<LockHandle>>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ClusterStore>, config: &TxnConfig) -> Self {
        Self {
            lock: DistributedLock::new(store, config.lock_ttl()),
            timeout: config.lock_timeout(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Take `name` outside any transaction, waiting up to the lock timeout
    ///
    /// The lock is held until the handle is released or dropped.
    pub async fn acquire(&self, name: &str, owner: &str) -> Result<LockHandle> {
        self.lock.acquire(name, owner, self.timeout).await
    }

    /// Names currently held on behalf of `txn_id`
    pub fn held_by(&self, txn_id: Uuid) -> Vec<String> {
        self.held
            .lock()
            .unwrap()
            .get(&txn_id)
            .map(|hs| hs.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Take every lock listed in the context that this transaction lacks
    pub async fn lock_for(&self, ctx: &TxnCtx) -> Result<()> {
        let txn_id = ctx.txn_id();
        let mut names: Vec<String> = ctx.get(LOCKS_KEY)?;
        // Fixed order so two transactions never wait on each other crosswise
        names.sort();
        names.dedup();

        let owner = txn_id.to_string();
        for name in names {
            if self.held_by(txn_id).contains(&name) {
                continue;
            }
            let handle = self.lock.acquire(&name, &owner, self.timeout).await?;
            tracing::info!(parent: ctx.logger(), lock = %name, "Locked");
            self.held
                .lock()
                .unwrap()
                .entry(txn_id)
                .or_default()
                .push(handle);
        }
        Ok(())
    }

    /// Release everything held for `txn_id`. Safe to call repeatedly.
    pub fn release_all(&self, txn_id: Uuid) -> Result<()> {
        let handles = self.held.lock().unwrap().remove(&txn_id).unwrap_or_default();
        let mut first_err = None;
        for handle in handles.iter().rev() {
            if handle.lease_lost() {
                tracing::warn!(
                    txn_id = %txn_id,
                    lock = %handle.name(),
                    "Lock lease was lost while held; cluster state may need reconciliation"
                );
            }
            if let Err(e) = handle.release() {
                tracing::error!(txn_id = %txn_id, lock = %handle.name(), error = %e, "Failed to release lock");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register `txn.lock` and `txn.unlock` on this node's registry
    pub fn register_steps(self: &Arc<Self>, registry: &StepRegistry) {
        let locks = self.clone();
        registry.register(LOCK_STEP, move |ctx: TxnCtx| {
            let locks = locks.clone();
            async move { locks.lock_for(&ctx).await }
        });
        let locks = self.clone();
        registry.register(UNLOCK_STEP, move |ctx: TxnCtx| {
            let locks = locks.clone();
            async move { locks.release_all(ctx.txn_id()) }
        });
    }
}

/// Build the lock/unlock step pair for `resource`, run on `coordinator`
///
/// The resource name is recorded in the context so the lock step knows what
/// to take.
pub fn lock_steps(ctx: &TxnCtx, resource: &str, coordinator: NodeId) -> (Step, Step) {
    let mut names: Vec<String> = ctx.get(LOCKS_KEY).unwrap_or_default();
    if !names.iter().any(|n| n == resource) {
        names.push(resource.to_string());
    }
    ctx.set(LOCKS_KEY, names);

    let lock = Step::new(LOCK_STEP, vec![coordinator]).with_undo(UNLOCK_STEP);
    let unlock = Step::new(UNLOCK_STEP, vec![coordinator]);
    (lock, unlock)
}
