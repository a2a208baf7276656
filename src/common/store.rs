//! Cluster key-value store abstraction
//!
//! The daemon keeps peer and volume metadata, and the lock records, in a
//! strongly-consistent replicated store. Everything above this module talks
//! to [`ClusterStore`]; the in-memory backend here serves single-node
//! daemons and in-process test clusters (several nodes sharing one `Arc`).

use crate::common::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub type LeaseId = u64;

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Stream of events under one key prefix
pub struct Watcher {
    prefix: String,
    inner: BroadcastStream<WatchEvent>,
}

impl Watcher {
    /// Next event under the prefix; `None` once the store is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        while let Some(item) = self.inner.next().await {
            match item {
                Ok(event) if event.key().starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                // Lagged receivers skip ahead; callers re-read state anyway
                Err(_) => continue,
            }
        }
        None
    }
}

/// Trait for cluster store backends
pub trait ClusterStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;
    /// Returns whether the key existed
    fn delete(&self, key: &str) -> Result<bool>;
    /// All live entries whose key starts with `prefix`, in key order
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// Write `value` only if the current value equals `expected`
    /// (`None` = key must be absent). Returns whether the write happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool>;
    /// Delete the key only if its current value equals `expected`
    fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;
    fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;
    /// Extend a lease by its TTL; `false` if it already expired
    fn keep_alive(&self, lease: LeaseId) -> Result<bool>;
    /// Drop a lease and every key attached to it
    fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
    fn watch(&self, prefix: &str) -> Watcher;
}

/// Read a JSON-encoded record
pub fn get_json<T: DeserializeOwned>(store: &dyn ClusterStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Write a JSON-encoded record
pub fn put_json<T: Serialize>(store: &dyn ClusterStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
    store.put(key, bytes, None)
}

/// List JSON-encoded records under a prefix
pub fn list_json<T: DeserializeOwned>(store: &dyn ClusterStore, prefix: &str) -> Result<Vec<T>> {
    store
        .list(prefix)?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Into::into))
        .collect()
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl MemState {
    /// Drop expired leases and their keys, returning the resulting events
    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut events = Vec::new();
        for id in expired {
            events.extend(self.drop_lease(id));
        }
        events
    }

    fn drop_lease(&mut self, id: LeaseId) -> Vec<WatchEvent> {
        self.leases.remove(&id);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .map(|key| {
                self.entries.remove(&key);
                WatchEvent::Delete { key }
            })
            .collect()
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => {
                Err(crate::Error::Store(format!("lease {} not found", id)))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory store (default)
pub struct MemClusterStore {
    state: Mutex<MemState>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemClusterStore {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemState::default()),
            events,
        }
    }

    pub fn shared() -> Arc<dyn ClusterStore> {
        Arc::new(Self::new())
    }

    /// Run `f` against live state and publish whatever it changed
    fn with_state<R>(&self, f: impl FnOnce(&mut MemState, &mut Vec<WatchEvent>) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let mut events = state.expire(Instant::now());
        let out = f(&mut state, &mut events);
        drop(state);
        for event in events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
        out
    }
}

impl Default for MemClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore for MemClusterStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_state(|s, _| s.entries.get(key).map(|e| e.value.clone())))
    }

    fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        self.with_state(|s, events| {
            s.check_lease(lease)?;
            s.entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease,
                },
            );
            events.push(WatchEvent::Put {
                key: key.to_string(),
                value,
            });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_state(|s, events| {
            let existed = s.entries.remove(key).is_some();
            if existed {
                events.push(WatchEvent::Delete {
                    key: key.to_string(),
                });
            }
            existed
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.with_state(|s, _| {
            s.entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect()
        }))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        self.with_state(|s, events| {
            s.check_lease(lease)?;
            let current = s.entries.get(key).map(|e| e.value.as_slice());
            if current != expected {
                return Ok(false);
            }
            s.entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease,
                },
            );
            events.push(WatchEvent::Put {
                key: key.to_string(),
                value,
            });
            Ok(true)
        })
    }

    fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self.with_state(|s, events| {
            match s.entries.get(key) {
                Some(e) if e.value == expected => {}
                _ => return false,
            }
            s.entries.remove(key);
            events.push(WatchEvent::Delete {
                key: key.to_string(),
            });
            true
        }))
    }

    fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        Ok(self.with_state(|s, _| {
            s.next_lease += 1;
            let id = s.next_lease;
            s.leases.insert(
                id,
                Lease {
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            );
            id
        }))
    }

    fn keep_alive(&self, lease: LeaseId) -> Result<bool> {
        Ok(self.with_state(|s, _| match s.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                true
            }
            None => false,
        }))
    }

    fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.with_state(|s, events| events.extend(s.drop_lease(lease)));
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher {
            prefix: prefix.to_string(),
            inner: BroadcastStream::new(self.events.subscribe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_list() {
        let store = MemClusterStore::new();
        store.put("volumes/a", b"1".to_vec(), None).unwrap();
        store.put("volumes/b", b"2".to_vec(), None).unwrap();
        store.put("peers/x", b"3".to_vec(), None).unwrap();

        assert_eq!(store.get("volumes/a").unwrap().unwrap(), b"1");
        let vols = store.list("volumes/").unwrap();
        assert_eq!(vols.len(), 2);
        assert_eq!(vols[0].0, "volumes/a");

        assert!(store.delete("volumes/a").unwrap());
        assert!(!store.delete("volumes/a").unwrap());
        assert!(store.get("volumes/a").unwrap().is_none());
    }

    #[test]
    fn test_compare_and_swap() {
        let store = MemClusterStore::new();
        assert!(store.compare_and_swap("k", None, b"a".to_vec(), None).unwrap());
        assert!(!store.compare_and_swap("k", None, b"b".to_vec(), None).unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"a"), b"b".to_vec(), None)
            .unwrap());
        assert!(!store.compare_and_delete("k", b"a").unwrap());
        assert!(store.compare_and_delete("k", b"b").unwrap());
    }

    #[test]
    fn test_lease_expiry_drops_keys() {
        let store = MemClusterStore::new();
        let lease = store.grant_lease(Duration::from_millis(20)).unwrap();
        store.put("locks/v", b"me".to_vec(), Some(lease)).unwrap();
        assert!(store.get("locks/v").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("locks/v").unwrap().is_none());
        assert!(!store.keep_alive(lease).unwrap());
        assert!(store.put("x", b"y".to_vec(), Some(lease)).is_err());
    }

    #[test]
    fn test_revoke_lease() {
        let store = MemClusterStore::new();
        let lease = store.grant_lease(Duration::from_secs(60)).unwrap();
        store.put("locks/v", b"me".to_vec(), Some(lease)).unwrap();
        store.revoke_lease(lease).unwrap();
        assert!(store.get("locks/v").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let store = MemClusterStore::new();
        let mut watcher = store.watch("locks/");
        store.put("volumes/a", b"1".to_vec(), None).unwrap();
        store.put("locks/a", b"2".to_vec(), None).unwrap();
        store.delete("locks/a").unwrap();

        assert_eq!(
            watcher.next().await,
            Some(WatchEvent::Put {
                key: "locks/a".into(),
                value: b"2".to_vec()
            })
        );
        assert_eq!(
            watcher.next().await,
            Some(WatchEvent::Delete {
                key: "locks/a".into()
            })
        );
    }
}
