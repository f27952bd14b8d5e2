//! Executor agent: supervises exactly one task as a child process.
//!
//! While the task runs, the agent keeps two leased records alive: the
//! liveness record under `executor/{job}/{task}` (the signal planning uses
//! to tell a running task from a vanished one) and the usage record under
//! `working/{worker}/{task}` (what the worker aggregates into its
//! heartbeat). On exit it finalizes the usage curve, persists the durable
//! terminal task record, revokes its lease for immediate deregistration and
//! reports the child's exit code.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::{GridError, Result};
use crate::mesh::{ExecutorApi, Mesh};
use crate::model::Task;
use crate::procs;
use crate::store::{keys, Lease, Store};
use crate::worker::Spawner;

pub struct ExecutorAgent {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: NodeConfig,
    lease: Arc<dyn Lease>,
    task: Mutex<Task>,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    child_pid: AtomicU32,
}

impl ExecutorAgent {
    /// Grant the agent's lease and anchor the task's usage curve at the
    /// actual start time.
    pub async fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: NodeConfig,
        mut task: Task,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<Arc<Self>> {
        let lease = store.lease(config.lease_ttl).await?;
        task.created = clock.now_ms();
        Ok(Arc::new(Self {
            store,
            clock,
            config,
            lease,
            task: Mutex::new(task),
            ready: Mutex::new(ready),
            child_pid: AtomicU32::new(0),
        }))
    }

    pub fn task_id(&self) -> String {
        self.task.lock().unwrap().id.clone()
    }

    /// Refresh the leased liveness and usage records.
    async fn publish(&self) -> Result<()> {
        let task = self.task.lock().unwrap().clone();
        let json = serde_json::to_string(&task)?;
        self.lease
            .put(&keys::executor(&task.job, &task.id), &json)
            .await?;
        self.lease
            .put(&keys::working(&task.worker, &task.id), &json)
            .await?;
        Ok(())
    }

    fn signal_ready(&self) {
        if let Some(tx) = self.ready.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Run the task to completion. Returns the exit code to propagate.
    pub async fn run(&self) -> Result<i32> {
        let task = self.task.lock().unwrap().clone();
        tracing::info!(task_id = %task.id, cmd = %task.cmd, "Executing task");

        self.publish().await?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&task.cmd).envs(&task.env);
        if !task.cwd.is_empty() {
            cmd.current_dir(&task.cwd);
        }
        match log_files(&task.id) {
            Ok((out, err)) => {
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Log files unavailable, discarding output");
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        cmd.stdin(Stdio::null());

        let mut child = match procs::group_spawn(&mut cmd) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Spawn failed");
                self.finalize(None, Some(format!("spawn failed: {e}"))).await?;
                return Err(e.into());
            }
        };
        self.child_pid
            .store(child.id().unwrap_or_default(), Ordering::SeqCst);
        self.signal_ready();

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = poll.tick() => {
                    if let Err(e) = self.lease.keep_alive().await {
                        tracing::warn!(task_id = %task.id, error = %e, "Lease renewal failed");
                    }
                    if let Err(e) = self.publish().await {
                        tracing::warn!(task_id = %task.id, error = %e, "Record refresh failed");
                    }
                }
            }
        };

        match status {
            Ok(status) => {
                let code = status.code();
                let error = match code {
                    Some(0) => None,
                    Some(n) => Some(format!("exit code {n}")),
                    None => Some("terminated by signal".to_string()),
                };
                tracing::info!(task_id = %task.id, code = ?code, "Task exited");
                self.finalize(code, error).await?;
                Ok(code.unwrap_or(1))
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Wait failed");
                self.finalize(None, Some(format!("wait failed: {e}"))).await?;
                Err(e.into())
            }
        }
    }

    /// Record the terminal state: stamp `finished`/`code`/`error`, truncate
    /// the usage curve at the finish instant, persist the durable task
    /// record and revoke the lease so the liveness records vanish now.
    async fn finalize(&self, code: Option<i32>, error: Option<String>) -> Result<()> {
        let finished = self.clock.now_ms();
        let task = {
            let mut task = self.task.lock().unwrap();
            task.finished = finished;
            task.code = code;
            task.error = error.unwrap_or_default();
            let end = finished - task.created;
            let trailing: Vec<i64> = task.usage.ticks().filter(|t| *t > end).collect();
            if !trailing.is_empty() {
                let at_end = task.usage.at(end);
                for tick in trailing {
                    task.usage.remove(tick);
                }
                if let Some(sample) = at_end {
                    task.usage.insert(end, sample);
                }
            }
            task.clone()
        };
        self.store
            .put(
                &keys::started(&task.job, &task.step, &task.id),
                &serde_json::to_string(&task)?,
            )
            .await?;
        self.lease.revoke().await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutorApi for ExecutorAgent {
    /// Terminate the task's whole process group, under the per-task lock so
    /// concurrent kill requests do not race. The lock is released on every
    /// path by the guard.
    async fn kill(&self) -> Result<()> {
        let id = self.task_id();
        let guard = self
            .store
            .try_lock(&keys::kill_lock(&id))
            .await?
            .ok_or_else(|| GridError::LockContended(keys::kill_lock(&id)))?;
        let pid = self.child_pid.load(Ordering::SeqCst);
        tracing::info!(task_id = %id, pid, "Killing task");
        if pid != 0 {
            procs::terminate_group(pid, self.config.kill_grace).await;
        }
        drop(guard);
        Ok(())
    }
}

fn log_files(task_id: &str) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let safe: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let base = std::env::temp_dir().join(safe);
    Ok((
        std::fs::File::create(base.with_extension("stdout"))?,
        std::fs::File::create(base.with_extension("stderr"))?,
    ))
}

/// Spawner that runs the executor agent as an in-process task instead of a
/// forked `taskgrid execute` child: the task command itself is still a real
/// child process in its own group. Backs single-process serving and the
/// test harness, where the in-memory store cannot span processes.
pub struct LocalSpawner {
    store: Arc<dyn Store>,
    mesh: Arc<dyn Mesh>,
    clock: Arc<dyn Clock>,
    config: NodeConfig,
}

impl LocalSpawner {
    pub fn new(
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
        clock: Arc<dyn Clock>,
        config: NodeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            mesh,
            clock,
            config,
        })
    }
}

#[async_trait]
impl Spawner for LocalSpawner {
    async fn spawn(&self, task_id: &str, task: &Task) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let agent = ExecutorAgent::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.clone(),
            task.clone(),
            Some(ready_tx),
        )
        .await?;

        self.mesh.register_executor(task_id, agent.clone());
        let mesh = self.mesh.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = agent.run().await {
                tracing::warn!(task_id = %id, error = %e, "Executor failed");
            }
            mesh.unregister_executor(&id);
        });

        match tokio::time::timeout(self.config.fork_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(GridError::ForkTimeout(task_id.to_string())),
        }
    }
}
