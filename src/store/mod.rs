//! Coordination-store contract.
//!
//! All cross-node coordination — dispatch ownership, liveness detection,
//! mutual exclusion — goes through a shared, strongly-consistent key-value
//! store offering leases, named locks and prefix watches. This module
//! defines the primitive contract the engine is written against plus an
//! in-memory reference implementation ([`MemStore`]) used by tests and
//! single-process serving; a networked backend (e.g. an etcd client) plugs
//! in behind the same traits.

pub mod keys;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemStore;

/// A change observed by a prefix watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// RAII handle for a named distributed lock: dropping it releases the lock
/// on every code path, including unwinding out of an error.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard")
    }
}

/// A TTL-bound handle: keys written through it vanish when the owner stops
/// renewing, which is the system's only crash-detection signal.
#[async_trait]
pub trait Lease: Send + Sync + 'static {
    /// Write a key bound to this lease's lifetime.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Push the expiry out by one TTL. Must be called strictly more often
    /// than the TTL by whichever loop owns the lease.
    async fn keep_alive(&self) -> Result<()>;

    /// Drop the lease and every key bound to it immediately, rather than
    /// waiting for the TTL to run out.
    async fn revoke(&self) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys under `prefix`, full key -> value.
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    async fn lease(&self, ttl: Duration) -> Result<Arc<dyn Lease>>;

    /// Attempt to take the named lock without waiting. `None` means it is
    /// held elsewhere; callers abandon the guarded operation for this cycle
    /// and retry on the next one.
    async fn try_lock(&self, name: &str) -> Result<Option<LockGuard>>;

    /// Subscribe to put/delete events under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;
}
