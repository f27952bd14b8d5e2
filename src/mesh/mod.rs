//! RPC mesh contract.
//!
//! Nodes expose capabilities (a worker's `start`, an executor's `kill`) and
//! look each other up by node id. Only the capability surface is defined
//! here; the wire transport is an external collaborator. [`LocalMesh`] is
//! the in-process registry used by tests and single-process serving.

pub mod local;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Task;

pub use local::LocalMesh;

/// Capability served by a worker node.
#[async_trait]
pub trait WorkerApi: Send + Sync + 'static {
    /// Ask the worker to start the given tasks (task id -> spec). The worker
    /// runs its own authoritative capacity check and forks one process per
    /// task that passes; the returned ids are the accepted subset. Rejected
    /// tasks are simply absent and stay pending for the next cycle.
    async fn start(&self, tasks: BTreeMap<String, Task>) -> Result<Vec<String>>;
}

/// Capability served by an executor supervising one task.
#[async_trait]
pub trait ExecutorApi: Send + Sync + 'static {
    /// Terminate the task's whole process tree.
    async fn kill(&self) -> Result<()>;
}

/// Capability registry addressed by node id.
pub trait Mesh: Send + Sync + 'static {
    fn register_worker(&self, id: &str, api: Arc<dyn WorkerApi>);
    fn unregister_worker(&self, id: &str);
    fn worker(&self, id: &str) -> Option<Arc<dyn WorkerApi>>;

    fn register_executor(&self, id: &str, api: Arc<dyn ExecutorApi>);
    fn unregister_executor(&self, id: &str);
    fn executor(&self, id: &str) -> Option<Arc<dyn ExecutorApi>>;
}
