use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::Usage;

/// One dispatched process execution belonging to a step, bound to exactly
/// one worker. Planned in memory; becomes the durable record of the work
/// once a worker accepts the dispatch; overwritten with the terminal state
/// by its executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Per-step instance ordinal, exposed to command templates.
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub created: i64,
    /// Wall-clock finish time in ms; zero while running.
    #[serde(default)]
    pub finished: i64,
    /// Non-empty marks the task as failed: it does not count toward the
    /// step's `instances` and a replacement is planned.
    #[serde(default)]
    pub error: String,
    /// Child exit code, when the process ran to an exit.
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Owning job id.
    #[serde(default)]
    pub job: String,
    /// Owning step name.
    #[serde(default)]
    pub step: String,
    /// Worker the task was dispatched to.
    #[serde(default)]
    pub worker: String,
    /// Projected (then finalized) draw, ticks relative to `created`.
    #[serde(default)]
    pub usage: Usage,
}

impl Task {
    /// Deterministic task id; re-planning the same assignment produces the
    /// same id, so a double dispatch overwrites instead of duplicating.
    pub fn make_id(job: &str, step: &str, worker: &str, index: u32) -> String {
        format!("j{job}-s{step}-w{worker}-i{index}")
    }

    pub fn is_finished(&self) -> bool {
        self.finished > 0
    }

    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.error.is_empty()
    }

    pub fn errored(&self) -> bool {
        self.is_finished() && !self.error.is_empty()
    }

    /// Usage curve in wall-clock ticks.
    pub fn wallclock_usage(&self) -> Usage {
        self.usage.offset(self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    #[test]
    fn state_predicates() {
        let mut task = Task {
            id: "t".into(),
            created: 100,
            ..Default::default()
        };
        assert!(!task.is_finished());
        assert!(!task.succeeded());

        task.finished = 200;
        assert!(task.succeeded());
        assert!(!task.errored());

        task.error = "exit code 1".into();
        assert!(task.errored());
        assert!(!task.succeeded());
    }

    #[test]
    fn wallclock_usage_anchors_at_created() {
        let task = Task {
            created: 1_000,
            usage: Usage::new().with(0, Resource::scalar("cpu", 1.0)),
            ..Default::default()
        };
        assert_eq!(
            task.wallclock_usage().ticks().collect::<Vec<_>>(),
            vec![1_000]
        );
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(
            Task::make_id("j1", "build", "w1", 4),
            Task::make_id("j1", "build", "w1", 4)
        );
        assert_ne!(
            Task::make_id("j1", "build", "w1", 4),
            Task::make_id("j1", "build", "w2", 4)
        );
    }
}
