//! Test harness: an in-memory grid (store + mesh + real worker agents) with
//! a simulated executor spawner and a manual clock, so scheduling sweeps and
//! lease expiry are fully deterministic.

// Each test crate that declares `mod test_harness` uses a different subset.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use taskgrid::clock::{Clock, ManualClock};
use taskgrid::config::NodeConfig;
use taskgrid::error::Result;
use taskgrid::mesh::{LocalMesh, Mesh};
use taskgrid::model::{Job, Step, Task};
use taskgrid::resource::Resource;
use taskgrid::scheduler::Scheduler;
use taskgrid::store::{keys, Lease, MemStore, Store};
use taskgrid::worker::{Spawner, WorkerAgent};

pub const LEASE_TTL: Duration = Duration::from_secs(10);

/// A "forked" executor that exists only as leased store records: alive until
/// finished through the harness or until its lease runs out.
pub struct SimExecutor {
    pub task: Task,
    lease: Arc<dyn Lease>,
}

/// Spawner standing in for real process forks. Spawning publishes the
/// executor liveness and usage records exactly like a real executor would;
/// tests then finish tasks explicitly.
pub struct SimSpawner {
    store: Arc<MemStore>,
    clock: Arc<ManualClock>,
    running: Mutex<Vec<SimExecutor>>,
}

impl SimSpawner {
    pub fn new(store: Arc<MemStore>, clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            running: Mutex::new(Vec::new()),
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .map(|sim| sim.task.clone())
            .collect()
    }

    /// Finish every running task with the given error (empty = success):
    /// write the terminal record and revoke the executor lease, as a real
    /// executor does on exit. Returns how many finished.
    pub async fn finish_all(&self, error: &str) -> Result<usize> {
        let drained: Vec<SimExecutor> = std::mem::take(&mut *self.running.lock().unwrap());
        let count = drained.len();
        for sim in drained {
            let mut task = sim.task;
            task.finished = self.clock.now_ms();
            task.error = error.to_string();
            task.code = Some(if error.is_empty() { 0 } else { 1 });
            self.store
                .put(
                    &keys::started(&task.job, &task.step, &task.id),
                    &serde_json::to_string(&task)?,
                )
                .await?;
            sim.lease.revoke().await?;
        }
        Ok(count)
    }

    /// Drop the bookkeeping for tasks on `worker_id` without finishing them;
    /// their leases then expire like a crashed node's would.
    pub fn abandon_worker(&self, worker_id: &str) {
        self.running
            .lock()
            .unwrap()
            .retain(|sim| sim.task.worker != worker_id);
    }

    /// Renew the leases of everything still running (a live executor's
    /// periodic upkeep).
    pub async fn keep_alive(&self) -> Result<()> {
        let leases: Vec<Arc<dyn Lease>> = self
            .running
            .lock()
            .unwrap()
            .iter()
            .map(|sim| sim.lease.clone())
            .collect();
        for lease in leases {
            lease.keep_alive().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Spawner for SimSpawner {
    async fn spawn(&self, task_id: &str, task: &Task) -> Result<()> {
        let lease = self.store.lease(LEASE_TTL).await?;
        let mut task = task.clone();
        task.created = self.clock.now_ms();
        let json = serde_json::to_string(&task)?;
        lease.put(&keys::executor(&task.job, task_id), &json).await?;
        lease.put(&keys::working(&task.worker, task_id), &json).await?;
        self.running.lock().unwrap().push(SimExecutor { task, lease });
        Ok(())
    }
}

/// One in-memory grid: a scheduler plus any number of worker agents, all
/// sharing the same store, mesh and manual clock.
pub struct TestGrid {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemStore>,
    pub mesh: Arc<LocalMesh>,
    pub scheduler: Arc<Scheduler>,
    pub spawner: Arc<SimSpawner>,
    pub workers: Vec<Arc<WorkerAgent>>,
}

impl TestGrid {
    pub fn new() -> Self {
        let clock = ManualClock::new(1_000_000);
        let store = MemStore::new(clock.clone());
        let mesh = LocalMesh::new();
        let config = NodeConfig::new("sched").with_lease_ttl(LEASE_TTL);
        let scheduler = Scheduler::new(store.clone(), mesh.clone(), clock.clone(), config);
        let spawner = SimSpawner::new(store.clone(), clock.clone());
        Self {
            clock,
            store,
            mesh,
            scheduler,
            spawner,
            workers: Vec::new(),
        }
    }

    /// Bring up a worker agent with the given tags and a scalar cpu
    /// capacity, registered on the mesh and selectable immediately.
    pub async fn add_worker(&mut self, id: &str, tags: &[&str], cpu: f64) -> Arc<WorkerAgent> {
        let config = NodeConfig::new(id)
            .with_lease_ttl(LEASE_TTL)
            .with_tags(tags.iter().copied())
            .with_total(Resource::scalar("cpu", cpu));
        let agent = WorkerAgent::new(
            self.store.clone(),
            self.clock.clone(),
            self.spawner.clone(),
            config,
        )
        .await
        .expect("worker agent");
        self.mesh.register_worker(id, agent.clone());
        self.workers.push(agent.clone());
        agent
    }

    /// Periodic upkeep for every live worker: renew leases and republish
    /// heartbeats, as the run loops would on their poll interval.
    pub async fn tick_workers(&self) {
        for worker in &self.workers {
            worker.upkeep().await;
        }
        let _ = self.spawner.keep_alive().await;
    }

    pub async fn started_tasks(&self, job: &str, step: &str) -> BTreeMap<String, Task> {
        let mut out = BTreeMap::new();
        for (key, value) in self
            .store
            .get_prefix(&keys::started_prefix(job, step))
            .await
            .expect("store")
        {
            let task: Task = serde_json::from_str(&value).expect("task record");
            out.insert(keys::last_segment(&key).to_string(), task);
        }
        out
    }

    pub async fn step_succeeded(&self, job: &str, step: &str) -> bool {
        self.store
            .get(&keys::success(job, step))
            .await
            .expect("store")
            .is_some()
    }

    pub async fn job_submitted(&self, job: &str) -> bool {
        self.store
            .get(&keys::submitted(job))
            .await
            .expect("store")
            .is_some()
    }
}

/// A job whose single step fans out over the `any` tag.
pub fn single_step_job(instances: u32, cpu: f64) -> Job {
    let mut steps = BTreeMap::new();
    steps.insert(
        "work".to_string(),
        Step {
            instances,
            cmd: "echo {{job.id}}-{{index}}".to_string(),
            res: Resource::scalar("cpu", cpu),
            ..Default::default()
        },
    );
    Job {
        cwd: "/tmp".to_string(),
        steps,
        ..Default::default()
    }
}
