use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::executor::LocalSpawner;
use crate::mesh::Mesh;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::watcher::Watcher;
use crate::worker::{ProcessSpawner, Spawner, WorkerAgent};

/// Which roles this node serves. Any combination is valid; a node serving
/// none simply acts as a client of the scheduler capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct Roles {
    pub scheduler: bool,
    pub watcher: bool,
    pub worker: bool,
}

/// One process's wiring of store, mesh and role agents.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn Store>,
    pub mesh: Arc<dyn Mesh>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<Scheduler>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Scheduler::new(store.clone(), mesh.clone(), clock.clone(), config.clone());
        Self {
            config,
            store,
            mesh,
            clock,
            scheduler,
        }
    }

    /// Start the requested role loops and run until the token is cancelled.
    ///
    /// With `fork_executors` the worker forks one `taskgrid execute` child
    /// per task (requires a cross-process store backend); otherwise
    /// executors run in-process.
    pub async fn run(
        &self,
        roles: Roles,
        fork_executors: bool,
        token: CancellationToken,
    ) -> Result<()> {
        let mut handles = Vec::new();

        if roles.worker {
            let spawner: Arc<dyn Spawner> = if fork_executors {
                Arc::new(ProcessSpawner::new(&self.config))
            } else {
                LocalSpawner::new(
                    self.store.clone(),
                    self.mesh.clone(),
                    self.clock.clone(),
                    self.config.clone(),
                )
            };
            let agent = WorkerAgent::new(
                self.store.clone(),
                self.clock.clone(),
                spawner,
                self.config.clone(),
            )
            .await?;
            self.mesh
                .register_worker(&self.config.node_id, agent.clone());
            tracing::info!(node_id = %self.config.node_id, "Starting node as worker");
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = agent.run(worker_token).await {
                    tracing::error!(error = %e, "Worker agent stopped");
                }
            }));
        }

        if roles.watcher {
            let watcher = Watcher::new(
                self.store.clone(),
                self.scheduler.clone(),
                self.config.clone(),
            );
            tracing::info!(node_id = %self.config.node_id, "Starting node as watcher");
            let watcher_token = token.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = watcher.run(watcher_token).await {
                    tracing::error!(error = %e, "Watcher stopped");
                }
            }));
        } else if roles.scheduler {
            // Without a watcher the scheduler still sweeps on the fixed
            // interval.
            let scheduler = self.scheduler.clone();
            let scheduler_token = token.clone();
            tracing::info!(node_id = %self.config.node_id, "Starting node as scheduler");
            handles.push(tokio::spawn(async move {
                scheduler.run(scheduler_token).await;
            }));
        }

        token.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
        Ok(())
    }
}
