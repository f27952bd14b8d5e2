//! Pluggable per-step planning.
//!
//! A step may name a policy overriding how its resource demand is projected
//! and how task instances are planned; unnamed steps get the built-in
//! default. Policies are resolved from a closed, name-keyed registry at plan
//! time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{GridError, Result};
use crate::model::{Job, Step, Task, Worker};
use crate::resource::Usage;
use crate::template::TemplateEngine;

/// Everything a policy sees when planning one step of one job.
pub struct PlanInput<'a> {
    pub job: &'a Job,
    pub step_name: &'a str,
    pub step: &'a Step,
    /// Success snapshots of the step's dependencies: dep step -> task id ->
    /// terminal task record.
    pub deps: &'a BTreeMap<String, BTreeMap<String, Task>>,
    /// Started-task records for this step, task id -> record.
    pub started: &'a BTreeMap<String, Task>,
    /// Task ids whose executor liveness record currently exists. A started,
    /// unfinished task without one has vanished and counts toward nothing.
    pub live: &'a BTreeSet<String>,
    /// Verified candidate workers, in selection order.
    pub workers: &'a [Worker],
    pub now_ms: i64,
    pub horizon_ms: i64,
}

/// Outcome of a planning pass. `Wait` (no-op, retried next cycle) and `Done`
/// (step complete) are distinct on purpose.
#[derive(Debug, Clone)]
pub enum Plan {
    Done,
    Wait,
    Dispatch(Vec<Assignment>),
}

/// One worker's share of a plan.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker: Worker,
    pub tasks: BTreeMap<String, Task>,
}

pub trait StepPolicy: Send + Sync + 'static {
    /// Projected draw of one task, ticks relative to the task's `created`.
    fn usage(&self, step: &Step, horizon_ms: i64) -> Usage;

    fn plan(&self, templates: &TemplateEngine, input: &PlanInput<'_>) -> Result<Plan>;
}

/// Built-in policy: a constant draw of the step's declared `res` over the
/// planning horizon, and one new task per available worker until `instances`
/// successes exist.
pub struct DefaultPolicy;

impl StepPolicy for DefaultPolicy {
    fn usage(&self, step: &Step, horizon_ms: i64) -> Usage {
        Usage::new()
            .with(0, step.res.clone())
            .with(horizon_ms, step.res.clone())
    }

    fn plan(&self, templates: &TemplateEngine, input: &PlanInput<'_>) -> Result<Plan> {
        let succeeded = input.started.values().filter(|t| t.succeeded()).count();
        let running = input
            .started
            .values()
            .filter(|t| !t.is_finished() && input.live.contains(&t.id))
            .count();
        let rest = input.step.instances as i64 - (succeeded + running) as i64;

        if rest > 0 {
            if input.workers.len() < input.step.concurrency as usize {
                return Ok(Plan::Wait);
            }
            let count = (rest as usize).min(input.workers.len());
            let next_index = input
                .started
                .values()
                .map(|t| t.index)
                .max()
                .map_or(0, |max| max + 1);

            let mut assignments = Vec::with_capacity(count);
            for (offset, worker) in input.workers.iter().take(count).enumerate() {
                let index = next_index + offset as u32;
                let task = build_task(templates, input, worker, index, self.usage(input.step, input.horizon_ms))?;
                let mut tasks = BTreeMap::new();
                tasks.insert(task.id.clone(), task);
                assignments.push(Assignment {
                    worker: worker.clone(),
                    tasks,
                });
            }
            return Ok(Plan::Dispatch(assignments));
        }

        if running > 0 {
            return Ok(Plan::Wait);
        }
        Ok(Plan::Done)
    }
}

fn build_task(
    templates: &TemplateEngine,
    input: &PlanInput<'_>,
    worker: &Worker,
    index: u32,
    usage: Usage,
) -> Result<Task> {
    let ctx = template_context(input, index)?;
    let cmd = templates.render(&input.step.cmd, &ctx)?;
    let mut cwd = templates.render(&input.step.cwd, &ctx)?;
    if cwd.is_empty() {
        cwd = input.job.cwd.clone();
    }
    let mut env = BTreeMap::new();
    for (key, template) in &input.step.env {
        env.insert(key.clone(), templates.render(template, &ctx)?);
    }
    Ok(Task {
        id: Task::make_id(&input.job.id, input.step_name, &worker.id, index),
        index,
        created: input.now_ms,
        cmd,
        cwd,
        env,
        job: input.job.id.clone(),
        step: input.step_name.to_string(),
        worker: worker.id.clone(),
        usage,
        ..Default::default()
    })
}

/// Context the `{{expr}}` templates resolve against.
fn template_context(input: &PlanInput<'_>, index: u32) -> Result<Value> {
    Ok(json!({
        "job": {
            "id": input.job.id,
            "cwd": input.job.cwd,
            "created": input.job.created,
        },
        "step": input.step_name,
        "index": index,
        "deps": serde_json::to_value(input.deps)?,
        "started": serde_json::to_value(input.started)?,
    }))
}

/// Root variables templates may reference; checked at submission.
pub const TEMPLATE_ROOTS: &[&str] = &["job", "step", "index", "deps", "started"];

/// Name-keyed policy registry with the built-in `default`.
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn StepPolicy>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        let mut policies: HashMap<String, Arc<dyn StepPolicy>> = HashMap::new();
        policies.insert("default".to_string(), Arc::new(DefaultPolicy));
        Self { policies }
    }

    pub fn register(&mut self, name: impl Into<String>, policy: Arc<dyn StepPolicy>) {
        self.policies.insert(name.into(), policy);
    }

    pub fn resolve(&self, step: &Step) -> Result<Arc<dyn StepPolicy>> {
        let name = step.policy.as_deref().unwrap_or("default");
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| GridError::UnknownPolicy(name.to_string()))
    }
}
