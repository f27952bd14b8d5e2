use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::Resource;

fn one() -> u32 {
    1
}

/// A declared unit of parallel work within a job. Never mutated after
/// submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Names of steps that must have a success record before this one runs.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Tags a worker must carry (all of them) to be eligible. Empty means
    /// the implicit `any` tag every worker publishes.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Target number of successful tasks.
    #[serde(default = "one")]
    pub instances: u32,
    /// Minimum simultaneously-available workers required to make progress.
    #[serde(default = "one")]
    pub concurrency: u32,
    /// Command template (`{{expr}}` substitution at plan time).
    #[serde(default)]
    pub cmd: String,
    /// Working-directory template; falls back to the job's `cwd`.
    #[serde(default)]
    pub cwd: String,
    /// Environment templates, resolved per task.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-task resource demand for the default usage policy.
    #[serde(default)]
    pub res: Resource,
    /// Registry key of the policy overriding `usage`/`plan`; `None` selects
    /// the built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            deps: Vec::new(),
            tags: Vec::new(),
            instances: 1,
            concurrency: 1,
            cmd: String::new(),
            cwd: String::new(),
            env: BTreeMap::new(),
            res: Resource::new(),
            policy: None,
        }
    }
}

impl Step {
    /// Tags to select workers on: the declared set, or the implicit `any`
    /// tag when none are declared.
    pub fn selection_tags(&self) -> Vec<String> {
        if self.tags.is_empty() {
            vec!["any".to_string()]
        } else {
            self.tags.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_single_instance() {
        let step = Step::default();
        assert_eq!(step.instances, 1);
        assert_eq!(step.concurrency, 1);
        assert!(step.policy.is_none());
    }

    #[test]
    fn selection_tags_fall_back_to_any() {
        assert_eq!(Step::default().selection_tags(), vec!["any"]);
        let tagged = Step {
            tags: vec!["gpu".into()],
            ..Default::default()
        };
        assert_eq!(tagged.selection_tags(), vec!["gpu"]);
    }
}
