//! Worker agent: capacity advertisement and task intake.
//!
//! The worker publishes a leased heartbeat (`worker/{id}`) aggregating the
//! draw of everything currently running on it, and leased tag-index entries
//! for every tag it carries. Its `start` capability runs the authoritative
//! capacity check — independent of the scheduler's speculative one, closing
//! the race window between selection and dispatch — and forks one process
//! per accepted task through a [`Spawner`], waiting a bounded time for each
//! fork's readiness acknowledgment.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::{GridError, Result};
use crate::mesh::WorkerApi;
use crate::model::{Task, Worker};
use crate::procs;
use crate::resource::Usage;
use crate::store::{keys, EventKind, Lease, Store};
use crate::watcher::Debouncer;

/// Line a freshly forked task process prints on stdout once it is up.
pub fn ready_line(task_id: &str) -> String {
    format!("ready {task_id}")
}

/// Fork capability: start one task process and resolve once it has
/// acknowledged readiness (or fail within the bounded wait).
#[async_trait]
pub trait Spawner: Send + Sync + 'static {
    async fn spawn(&self, task_id: &str, task: &Task) -> Result<()>;
}

/// Spawner that forks one `taskgrid execute` child per task, in its own
/// process group, and waits for the readiness line on the child's stdout.
/// Requires a store backend shared across processes to be useful.
pub struct ProcessSpawner {
    fork_timeout: Duration,
    kill_grace: Duration,
}

impl ProcessSpawner {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            fork_timeout: config.fork_timeout,
            kill_grace: config.kill_grace,
        }
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn(&self, task_id: &str, task: &Task) -> Result<()> {
        let exe = std::env::current_exe()?;
        let payload = serde_json::to_string(task)?;
        let mut cmd = Command::new(exe);
        cmd.arg("execute")
            .arg(task_id)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = procs::group_spawn(&mut cmd)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GridError::Io(std::io::Error::other("executor stdout unavailable")))?;
        let expected = ready_line(task_id);
        let wait_ready = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == expected {
                    return true;
                }
            }
            false
        };

        match tokio::time::timeout(self.fork_timeout, wait_ready).await {
            Ok(true) => {
                tracing::info!(task_id = %task_id, "Forked task is ready");
                // Reap the child in the background; its lifecycle is now the
                // executor's own business.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(task_id = %task_id, "Forked task exited before signalling readiness");
                let _ = child.wait().await;
                Err(GridError::ForkTimeout(task_id.to_string()))
            }
            Err(_) => {
                tracing::warn!(task_id = %task_id, "Forked task timed out, terminating it");
                if let Some(pid) = child.id() {
                    procs::terminate_group(pid, self.kill_grace).await;
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(GridError::ForkTimeout(task_id.to_string()))
            }
        }
    }
}

pub struct WorkerAgent {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    spawner: Arc<dyn Spawner>,
    config: NodeConfig,
    lease: Mutex<Arc<dyn Lease>>,
}

impl WorkerAgent {
    /// Grant the heartbeat lease, persist the configured tag declarations
    /// and publish the initial heartbeat and tag-index entries, so the
    /// worker is selectable as soon as this returns.
    pub async fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        spawner: Arc<dyn Spawner>,
        config: NodeConfig,
    ) -> Result<Arc<Self>> {
        let lease = store.lease(config.lease_ttl).await?;
        let agent = Arc::new(Self {
            store,
            clock,
            spawner,
            config,
            lease: Mutex::new(lease),
        });
        for tag in &agent.config.worker.tags {
            agent
                .store
                .put(&keys::worker_tag(&agent.config.node_id, tag), "1")
                .await?;
        }
        agent.publish_tags().await?;
        agent.publish_heartbeat().await?;
        tracing::info!(worker_id = %agent.config.node_id, "Worker up");
        Ok(agent)
    }

    fn id(&self) -> &str {
        &self.config.node_id
    }

    fn lease(&self) -> Arc<dyn Lease> {
        self.lease.lock().unwrap().clone()
    }

    /// Publish a leased tag-index entry for the implicit `any` tag plus
    /// every declared tag currently in the store.
    async fn publish_tags(&self) -> Result<()> {
        let lease = self.lease();
        lease.put(&keys::tagged("any", self.id()), "1").await?;
        let declared = self
            .store
            .get_prefix(&keys::worker_tags_prefix(self.id()))
            .await?;
        for key in declared.keys() {
            let tag = keys::last_segment(key);
            lease.put(&keys::tagged(tag, self.id()), "1").await?;
        }
        Ok(())
    }

    /// Aggregate draw of every task currently reporting under this worker,
    /// in wall-clock ticks.
    async fn aggregate_usage(&self) -> Result<Usage> {
        let mut curves = Vec::new();
        for value in self
            .store
            .get_prefix(&keys::working_prefix(self.id()))
            .await?
            .values()
        {
            let task: Task = serde_json::from_str(value)?;
            curves.push(task.wallclock_usage());
        }
        Ok(Usage::merge(curves.iter()))
    }

    /// Publish the heartbeat record the scheduler selects against.
    pub async fn publish_heartbeat(&self) -> Result<Worker> {
        let record = Worker {
            id: self.id().to_string(),
            total: self.config.worker.total.clone(),
            usage: self.aggregate_usage().await?,
        };
        self.lease()
            .put(&keys::worker(self.id()), &serde_json::to_string(&record)?)
            .await?;
        Ok(record)
    }

    /// Periodic upkeep plus watch-driven reactions: renew the lease, refresh
    /// the heartbeat, mirror declared-tag changes into the tag index, and
    /// republish (debounced) when the set of reporting tasks changes.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut tag_events = self
            .store
            .watch_prefix(&keys::worker_tags_prefix(self.id()))
            .await?;
        let mut working_events = self
            .store
            .watch_prefix(&keys::working_prefix(self.id()))
            .await?;

        let agent = self.clone();
        let republish = Debouncer::new(self.config.debounce, move || {
            let agent = agent.clone();
            async move {
                if let Err(e) = agent.publish_heartbeat().await {
                    tracing::warn!(worker_id = %agent.id(), error = %e, "Heartbeat publish failed");
                }
            }
        });

        let mut poll = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                Some(event) = tag_events.recv() => {
                    let tag = keys::last_segment(&event.key).to_string();
                    let result = match event.kind {
                        EventKind::Put => self.lease().put(&keys::tagged(&tag, self.id()), "1").await,
                        EventKind::Delete => self.store.delete(&keys::tagged(&tag, self.id())).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(worker_id = %self.id(), tag = %tag, error = %e, "Tag index update failed");
                    }
                }
                Some(_) = working_events.recv() => republish.call(),
                _ = poll.tick() => self.upkeep().await,
                _ = token.cancelled() => {
                    // Graceful shutdown deregisters immediately instead of
                    // waiting out the TTL.
                    let _ = self.lease().revoke().await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// One periodic upkeep tick: renew the lease (re-registering from
    /// scratch if it expired) and refresh the heartbeat. The run loop calls
    /// this on every poll interval.
    pub async fn upkeep(&self) {
        if let Err(e) = self.lease().keep_alive().await {
            tracing::warn!(worker_id = %self.id(), error = %e, "Lease renewal failed, re-registering");
            match self.store.lease(self.config.lease_ttl).await {
                Ok(fresh) => {
                    *self.lease.lock().unwrap() = fresh;
                    if let Err(e) = self.publish_tags().await {
                        tracing::warn!(worker_id = %self.id(), error = %e, "Tag republish failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.id(), error = %e, "Lease re-grant failed");
                    return;
                }
            }
        }
        if let Err(e) = self.publish_heartbeat().await {
            tracing::warn!(worker_id = %self.id(), error = %e, "Heartbeat publish failed");
        }
    }
}

#[async_trait]
impl WorkerApi for WorkerAgent {
    /// Authoritative intake: re-verify capacity task by task against the
    /// live aggregate plus everything accepted so far in this call, fork the
    /// survivors, and return the accepted ids. Tasks that fail the check or
    /// the fork are dropped; the scheduler retries them as still-pending
    /// instances next cycle.
    async fn start(&self, tasks: BTreeMap<String, Task>) -> Result<Vec<String>> {
        tracing::info!(
            worker_id = %self.id(),
            task_ids = ?tasks.keys().collect::<Vec<_>>(),
            "Start requested"
        );
        let total = &self.config.worker.total;
        let now = self.clock.now_ms();
        let mut committed = self.aggregate_usage().await?;
        let mut accepted = Vec::new();

        for (id, task) in &tasks {
            let projected = task.usage.offset(now);
            let combined = Usage::merge([&committed, &projected]);
            if !combined.below(total) {
                tracing::warn!(worker_id = %self.id(), task_id = %id, "Rejecting task, over capacity");
                continue;
            }
            match self.spawner.spawn(id, task).await {
                Ok(()) => {
                    committed = combined;
                    accepted.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.id(), task_id = %id, error = %e, "Fork failed");
                }
            }
        }

        // Refresh the heartbeat so the next selection round sees the new
        // draw without waiting for the poll tick.
        if let Err(e) = self.publish_heartbeat().await {
            tracing::warn!(worker_id = %self.id(), error = %e, "Heartbeat publish failed");
        }
        tracing::info!(worker_id = %self.id(), accepted = accepted.len(), "Start handled");
        Ok(accepted)
    }
}
