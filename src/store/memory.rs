//! In-memory coordination store.
//!
//! Implements the full [`Store`] contract against process-local state, with
//! lease expiry driven by the injected [`Clock`]: expired leases are swept
//! on every store operation, so with a manual clock tests control exactly
//! when a key "vanishes". Single-process only; a networked backend replaces
//! this behind the same traits for multi-node deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::error::{GridError, Result};
use crate::store::{EventKind, Lease, LockGuard, Store, WatchEvent};

struct Entry {
    value: String,
    lease: Option<u64>,
}

struct LeaseState {
    ttl: Duration,
    deadline_ms: i64,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<u64, LeaseState>,
    watchers: Vec<Watcher>,
    next_lease_id: u64,
}

impl Inner {
    fn notify(&mut self, kind: EventKind, key: &str) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(WatchEvent {
                kind,
                key: key.to_string(),
            })
            .is_ok()
        });
    }

    fn detach_from_lease(&mut self, key: &str, lease: Option<u64>) {
        if let Some(id) = lease {
            if let Some(state) = self.leases.get_mut(&id) {
                state.keys.remove(key);
            }
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        if let Some(entry) = self.kv.remove(key) {
            self.detach_from_lease(key, entry.lease);
            self.notify(EventKind::Delete, key);
            true
        } else {
            false
        }
    }

    /// Drop every lease whose deadline has passed, deleting its keys and
    /// emitting delete events, exactly as a TTL expiry would.
    fn sweep(&mut self, now_ms: i64) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, state)| state.deadline_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(state) = self.leases.remove(&id) {
                for key in state.keys {
                    self.kv.remove(&key);
                    self.notify(EventKind::Delete, &key);
                }
            }
        }
    }
}

pub struct MemStore {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl MemStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            inner: Arc::new(Mutex::new(Inner::default())),
            locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Expire overdue leases now. Every operation sweeps lazily already;
    /// this exists for callers that want expiry to be observed without
    /// issuing an unrelated operation (e.g. the server's upkeep tick).
    pub fn sweep(&self) {
        self.inner.lock().unwrap().sweep(self.clock.now_ms());
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(self.clock.now_ms());
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(self.clock.now_ms());
        let previous = inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: None,
            },
        );
        if let Some(previous) = previous {
            inner.detach_from_lease(key, previous.lease);
        }
        inner.notify(EventKind::Put, key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(self.clock.now_ms());
        inner.remove_key(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(self.clock.now_ms());
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn lease(&self, ttl: Duration) -> Result<Arc<dyn Lease>> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now_ms();
        inner.sweep(now);
        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline_ms: now + ttl.as_millis() as i64,
                keys: BTreeSet::new(),
            },
        );
        Ok(Arc::new(MemLease {
            id,
            clock: self.clock.clone(),
            inner: self.inner.clone(),
        }))
    }

    async fn try_lock(&self, name: &str) -> Result<Option<LockGuard>> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.insert(name.to_string()) {
            return Ok(None);
        }
        let registry = self.locks.clone();
        let name = name.to_string();
        Ok(Some(LockGuard::new(move || {
            registry.lock().unwrap().remove(&name);
        })))
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

struct MemLease {
    id: u64,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl Lease for MemLease {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(self.clock.now_ms());
        if !inner.leases.contains_key(&self.id) {
            return Err(GridError::Store(format!(
                "lease {} expired or revoked",
                self.id
            )));
        }
        let previous = inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease: Some(self.id),
            },
        );
        if let Some(previous) = previous {
            if previous.lease != Some(self.id) {
                inner.detach_from_lease(key, previous.lease);
            }
        }
        if let Some(state) = inner.leases.get_mut(&self.id) {
            state.keys.insert(key.to_string());
        }
        inner.notify(EventKind::Put, key);
        Ok(())
    }

    async fn keep_alive(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now_ms();
        inner.sweep(now);
        match inner.leases.get_mut(&self.id) {
            Some(state) => {
                state.deadline_ms = now + state.ttl.as_millis() as i64;
                Ok(())
            }
            None => Err(GridError::Store(format!(
                "lease {} expired or revoked",
                self.id
            ))),
        }
    }

    async fn revoke(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.leases.remove(&self.id) {
            for key in state.keys {
                inner.kv.remove(&key);
                inner.notify(EventKind::Delete, &key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, Arc<MemStore>) {
        let clock = ManualClock::new(0);
        let store = MemStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn get_put_delete_round_trip() {
        let (_, store) = store();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.put("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_scan_is_bounded() {
        let (_, store) = store();
        store.put("job/a", "1").await.unwrap();
        store.put("job/b", "2").await.unwrap();
        store.put("worker/a", "3").await.unwrap();
        let jobs = store.get_prefix("job/").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains_key("job/a"));
        assert!(!jobs.contains_key("worker/a"));
    }

    #[tokio::test]
    async fn leased_keys_vanish_after_ttl() {
        let (clock, store) = store();
        let lease = store.lease(Duration::from_secs(10)).await.unwrap();
        lease.put("worker/w1", "{}").await.unwrap();
        assert!(store.get("worker/w1").await.unwrap().is_some());

        clock.advance(9_999);
        assert!(store.get("worker/w1").await.unwrap().is_some());

        clock.advance(1);
        assert!(store.get("worker/w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_alive_extends_the_deadline() {
        let (clock, store) = store();
        let lease = store.lease(Duration::from_secs(10)).await.unwrap();
        lease.put("worker/w1", "{}").await.unwrap();

        clock.advance(8_000);
        lease.keep_alive().await.unwrap();
        clock.advance(8_000);
        assert!(store.get("worker/w1").await.unwrap().is_some());

        clock.advance(2_001);
        assert!(store.get("worker/w1").await.unwrap().is_none());
        assert!(lease.keep_alive().await.is_err());
    }

    #[tokio::test]
    async fn revoke_deletes_immediately_and_fires_watch() {
        let (_, store) = store();
        let mut rx = store.watch_prefix("worker/").await.unwrap();
        let lease = store.lease(Duration::from_secs(10)).await.unwrap();
        lease.put("worker/w1", "{}").await.unwrap();
        lease.revoke().await.unwrap();
        assert!(store.get("worker/w1").await.unwrap().is_none());

        let put = rx.recv().await.unwrap();
        assert_eq!(put.kind, EventKind::Put);
        let del = rx.recv().await.unwrap();
        assert_eq!(del.kind, EventKind::Delete);
        assert_eq!(del.key, "worker/w1");
    }

    #[tokio::test]
    async fn unleased_put_over_leased_key_detaches_it() {
        let (clock, store) = store();
        let lease = store.lease(Duration::from_secs(10)).await.unwrap();
        lease.put("job/j1/started/s/t", "planned").await.unwrap();
        store.put("job/j1/started/s/t", "final").await.unwrap();
        clock.advance(60_000);
        // The durable overwrite survives lease expiry.
        assert_eq!(
            store.get("job/j1/started/s/t").await.unwrap(),
            Some("final".to_string())
        );
    }

    #[tokio::test]
    async fn locks_are_mutually_exclusive_and_released_on_drop() {
        let (_, store) = store();
        let guard = store.try_lock("update/j1").await.unwrap();
        assert!(guard.is_some());
        assert!(store.try_lock("update/j1").await.unwrap().is_none());
        drop(guard);
        assert!(store.try_lock("update/j1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_under_prefix_only() {
        let (_, store) = store();
        let mut rx = store.watch_prefix("submited/").await.unwrap();
        store.put("submited/j1", "{}").await.unwrap();
        store.put("worker/w1", "{}").await.unwrap();
        store.delete("submited/j1").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.kind, first.key.as_str()), (EventKind::Put, "submited/j1"));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            (second.kind, second.key.as_str()),
            (EventKind::Delete, "submited/j1")
        );
    }
}
