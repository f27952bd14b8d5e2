//! Scheduling engine: submit, check/update, worker selection, locked
//! dispatch, kill.
//!
//! Every scheduler instance is equal — there is no leader. Concurrent
//! instances coexist because each job's processing is serialized by a
//! per-job lock, each worker's dispatch by a per-worker lock, and planning
//! is idempotent with respect to already-persisted started records: a stale
//! plan re-dispatches the same deterministic task ids, which overwrite
//! rather than duplicate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{random_id, NodeConfig};
use crate::error::{GridError, Result};
use crate::mesh::Mesh;
use crate::model::{Job, Task, Worker};
use crate::policy::{Assignment, Plan, PlanInput, PolicyRegistry, TEMPLATE_ROOTS};
use crate::resource::Usage;
use crate::store::{keys, Store};
use crate::template::TemplateEngine;

pub struct Scheduler {
    store: Arc<dyn Store>,
    mesh: Arc<dyn Mesh>,
    clock: Arc<dyn Clock>,
    policies: Arc<PolicyRegistry>,
    templates: TemplateEngine,
    config: NodeConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
        clock: Arc<dyn Clock>,
        config: NodeConfig,
    ) -> Arc<Self> {
        Self::with_policies(store, mesh, clock, config, Arc::new(PolicyRegistry::new()))
    }

    pub fn with_policies(
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
        clock: Arc<dyn Clock>,
        config: NodeConfig,
        policies: Arc<PolicyRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            mesh,
            clock,
            policies,
            templates: TemplateEngine::new(),
            config,
        })
    }

    /// Validate and persist a job, assigning a random id if it carries none.
    pub async fn submit(&self, mut job: Job) -> Result<String> {
        job.validate()?;
        for (name, step) in &job.steps {
            self.policies.resolve(step)?;
            if !step.res.valid() {
                return Err(GridError::InvalidJob(format!(
                    "step \"{name}\" declares a negative resource"
                )));
            }
            self.templates.validate(&step.cmd, TEMPLATE_ROOTS)?;
            self.templates.validate(&step.cwd, TEMPLATE_ROOTS)?;
            for value in step.env.values() {
                self.templates.validate(value, TEMPLATE_ROOTS)?;
            }
        }

        if job.id.is_empty() {
            job.id = random_id();
        }
        if job.created == 0 {
            job.created = self.clock.now_ms();
        }
        let id = job.id.clone();
        self.store
            .put(&keys::submitted(&id), &serde_json::to_string(&job)?)
            .await?;
        tracing::info!(job_id = %id, steps = job.steps.len(), "Job submitted");
        Ok(id)
    }

    /// One full sweep: every submitted job is updated, each under its
    /// per-job lock so concurrent scheduler instances never process the same
    /// job at once while distinct jobs proceed in parallel.
    pub async fn check(&self) -> Result<()> {
        let submitted = self.store.get_prefix(keys::SUBMITTED_PREFIX).await?;
        let ids: Vec<String> = submitted
            .keys()
            .map(|k| keys::last_segment(k).to_string())
            .collect();
        tracing::debug!(jobs = ids.len(), "Checking submitted jobs");

        join_all(ids.iter().map(|id| self.check_one(id))).await;
        Ok(())
    }

    async fn check_one(&self, id: &str) {
        let guard = match self.store.try_lock(&keys::update_lock(id)).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!(job_id = %id, "Job is being updated elsewhere, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to acquire job lock");
                return;
            }
        };
        if let Err(e) = self.update(id).await {
            tracing::warn!(job_id = %id, error = %e, "Job update failed");
        }
        drop(guard);
    }

    /// Advance one job: run every pending step whose dependency closure has
    /// success records; delete the submitted record once nothing is pending.
    pub async fn update(&self, id: &str) -> Result<()> {
        let Some(raw) = self.store.get(&keys::submitted(id)).await? else {
            tracing::debug!(job_id = %id, "Job no longer submitted, nothing to update");
            return Ok(());
        };
        let job: Job = serde_json::from_str(&raw)?;

        let success = self.success_records(id).await?;
        let pending: Vec<&String> = job
            .steps
            .keys()
            .filter(|step| !success.contains_key(*step))
            .collect();

        if pending.is_empty() {
            self.store.delete(&keys::submitted(id)).await?;
            tracing::info!(job_id = %id, "Job done");
            return Ok(());
        }

        let runnable: Vec<&String> = pending
            .into_iter()
            .filter(|step| job.deps(step).iter().all(|dep| success.contains_key(dep)))
            .collect();
        tracing::info!(job_id = %id, steps = ?runnable, "Steps to run");

        join_all(runnable.into_iter().map(|step| {
            let deps: BTreeMap<String, BTreeMap<String, Task>> = job
                .deps(step)
                .into_iter()
                .filter_map(|dep| success.get(&dep).map(|snap| (dep, snap.clone())))
                .collect();
            let job = &job;
            async move {
                if let Err(e) = self.start_step(job, step, &deps).await {
                    tracing::warn!(job_id = %job.id, step = %step, error = %e, "Step start failed");
                }
            }
        }))
        .await;
        Ok(())
    }

    async fn success_records(
        &self,
        job_id: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, Task>>> {
        let mut success = BTreeMap::new();
        for (key, value) in self.store.get_prefix(&keys::success_prefix(job_id)).await? {
            let snapshot: BTreeMap<String, Task> = serde_json::from_str(&value)?;
            success.insert(keys::last_segment(&key).to_string(), snapshot);
        }
        Ok(success)
    }

    /// Plan and dispatch one step, or record its success when planning says
    /// it is complete.
    pub async fn start_step(
        &self,
        job: &Job,
        step_name: &str,
        deps: &BTreeMap<String, BTreeMap<String, Task>>,
    ) -> Result<()> {
        let step = job
            .steps
            .get(step_name)
            .ok_or_else(|| GridError::InvalidJob(format!("unknown step \"{step_name}\"")))?;
        let policy = self.policies.resolve(step)?;

        let mut started = BTreeMap::new();
        for (key, value) in self
            .store
            .get_prefix(&keys::started_prefix(&job.id, step_name))
            .await?
        {
            let task: Task = serde_json::from_str(&value)?;
            started.insert(keys::last_segment(&key).to_string(), task);
        }
        let live: BTreeSet<String> = self
            .store
            .get_prefix(&keys::executor_prefix(&job.id))
            .await?
            .keys()
            .map(|k| keys::last_segment(k).to_string())
            .collect();

        let demand = policy.usage(step, self.config.plan_horizon_ms);
        let workers = self.select(&step.selection_tags(), &demand).await?;

        let input = PlanInput {
            job,
            step_name,
            step,
            deps,
            started: &started,
            live: &live,
            workers: &workers,
            now_ms: self.clock.now_ms(),
            horizon_ms: self.config.plan_horizon_ms,
        };
        match policy.plan(&self.templates, &input)? {
            Plan::Done => {
                self.store
                    .put(
                        &keys::success(&job.id, step_name),
                        &serde_json::to_string(&started)?,
                    )
                    .await?;
                tracing::info!(job_id = %job.id, step = %step_name, tasks = started.len(), "Step finished");
            }
            Plan::Wait => {
                tracing::debug!(job_id = %job.id, step = %step_name, "Step waiting");
            }
            Plan::Dispatch(assignments) => {
                tracing::info!(
                    job_id = %job.id,
                    step = %step_name,
                    workers = workers.len(),
                    plans = assignments.len(),
                    "Dispatching step"
                );
                join_all(
                    assignments
                        .iter()
                        .map(|assignment| self.dispatch(&job.id, step_name, assignment)),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Tag-index intersection plus capacity verification.
    pub async fn select(&self, tags: &[String], demand: &Usage) -> Result<Vec<Worker>> {
        let mut candidates: Option<BTreeSet<String>> = None;
        for tag in tags {
            let under_tag: BTreeSet<String> = self
                .store
                .get_prefix(&keys::tagged_prefix(tag))
                .await?
                .keys()
                .map(|k| keys::last_segment(k).to_string())
                .collect();
            candidates = Some(match candidates {
                None => under_tag,
                Some(so_far) => so_far.intersection(&under_tag).cloned().collect(),
            });
        }
        let candidates = candidates.unwrap_or_default();

        let wallclock_demand = demand.offset(self.clock.now_ms());
        let mut available = Vec::new();
        for id in &candidates {
            let Some(raw) = self.store.get(&keys::worker(id)).await? else {
                // Tag entry outlived the heartbeat; the worker is gone.
                continue;
            };
            let worker: Worker = serde_json::from_str(&raw)?;
            if worker.verify(&wallclock_demand) {
                available.push(worker);
            }
        }
        tracing::info!(
            tags = ?tags,
            candidates = candidates.len(),
            available = available.len(),
            "Selected workers"
        );
        Ok(available)
    }

    /// Dispatch one assignment under the worker's lock. Failures are logged
    /// and swallowed: the next check cycle re-plans from the persisted
    /// started records, so an abandoned dispatch costs one cycle, not
    /// correctness.
    async fn dispatch(&self, job_id: &str, step_name: &str, assignment: &Assignment) {
        let worker_id = &assignment.worker.id;
        let guard = match self.store.try_lock(&keys::dispatch_lock(worker_id)).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!(worker_id = %worker_id, "Worker is being dispatched to elsewhere, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "Failed to acquire dispatch lock");
                return;
            }
        };

        let Some(api) = self.mesh.worker(worker_id) else {
            tracing::warn!(worker_id = %worker_id, "Worker not reachable over the mesh");
            return;
        };
        tracing::info!(
            job_id = %job_id,
            step = %step_name,
            worker_id = %worker_id,
            tasks = assignment.tasks.len(),
            "Dispatching tasks"
        );
        match api.start(assignment.tasks.clone()).await {
            Ok(accepted) => {
                for id in &accepted {
                    let Some(task) = assignment.tasks.get(id) else {
                        tracing::warn!(task_id = %id, "Worker accepted an unknown task id");
                        continue;
                    };
                    match serde_json::to_string(task) {
                        Ok(json) => {
                            if let Err(e) = self
                                .store
                                .put(&keys::started(job_id, step_name, id), &json)
                                .await
                            {
                                tracing::warn!(task_id = %id, error = %e, "Failed to persist started record");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %id, error = %e, "Failed to encode started record")
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "Dispatch failed");
            }
        }
        drop(guard);
    }

    /// Terminate every executor of a job. Unlike dispatch, failures are
    /// surfaced: kill is an interactive command.
    pub async fn kill(&self, job_id: &str) -> Result<()> {
        let executors = self.store.get_prefix(&keys::executor_prefix(job_id)).await?;
        let task_ids: Vec<String> = executors
            .keys()
            .map(|k| keys::last_segment(k).to_string())
            .collect();
        tracing::info!(job_id = %job_id, executors = task_ids.len(), "Killing job");

        let results = join_all(task_ids.iter().map(|task_id| async move {
            match self.mesh.executor(task_id) {
                Some(api) => api.kill().await,
                None => Err(GridError::ExecutorUnreachable(task_id.clone())),
            }
        }))
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Fixed-interval fallback sweep; the watcher provides the reactive
    /// path.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check().await {
                        tracing::warn!(error = %e, "Check sweep failed");
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    }
}
