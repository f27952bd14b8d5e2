use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::model::step::Step;

/// A user-submitted DAG of named steps. Immutable once submitted; all
/// progress bookkeeping (started tasks, success records) lives in the store
/// under the job's key namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub steps: BTreeMap<String, Step>,
}

impl Job {
    /// Transitive closure of `step`'s dependency names, the step itself
    /// excluded. Uses an explicit visited set, so it terminates even on a
    /// cyclic graph; cycles are rejected separately by [`Job::validate`].
    pub fn deps(&self, step: &str) -> Vec<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&str> = self
            .steps
            .get(step)
            .map(|s| s.deps.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(name) = stack.pop() {
            if out.insert(name.to_string()) {
                if let Some(dep) = self.steps.get(name) {
                    stack.extend(dep.deps.iter().map(String::as_str));
                }
            }
        }
        out.into_iter().collect()
    }

    /// Submission-time structural validation: every declared dependency must
    /// name a declared step, and the dependency graph must be acyclic.
    pub fn validate(&self) -> Result<()> {
        for (name, step) in &self.steps {
            for dep in &step.deps {
                if !self.steps.contains_key(dep) {
                    return Err(GridError::InvalidJob(format!(
                        "step \"{name}\" depends on undeclared step \"{dep}\""
                    )));
                }
            }
        }

        // Three-color DFS; a back-edge to an in-progress node is a cycle.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for root in self.steps.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            // (step, next-dep-index) frames of an explicit DFS.
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            marks.insert(root.as_str(), Mark::InProgress);
            while let Some((name, idx)) = stack.pop() {
                let deps = &self.steps[name].deps;
                if idx < deps.len() {
                    stack.push((name, idx + 1));
                    let dep = deps[idx].as_str();
                    match marks.get(dep) {
                        Some(Mark::InProgress) => {
                            return Err(GridError::CyclicDependency(dep.to_string()))
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(dep, Mark::InProgress);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    marks.insert(name, Mark::Done);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(deps: &[&str]) -> Step {
        Step {
            deps: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn job(steps: &[(&str, &[&str])]) -> Job {
        Job {
            id: "j1".into(),
            steps: steps
                .iter()
                .map(|(name, deps)| (name.to_string(), step(deps)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn deps_resolves_a_three_step_chain() {
        let j = job(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(j.deps("c"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(j.deps("b"), vec!["a".to_string()]);
        assert!(j.deps("a").is_empty());
    }

    #[test]
    fn deps_handles_diamonds_without_duplicates() {
        let j = job(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert_eq!(j.deps("d"), vec!["a", "b", "c"]);
    }

    #[test]
    fn deps_terminates_on_a_cycle() {
        let j = job(&[("a", &["b"]), ("b", &["a"])]);
        // Termination is the property under test; contents are incidental.
        let _ = j.deps("a");
    }

    #[test]
    fn validate_accepts_a_dag() {
        let j = job(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(j.validate().is_ok());
    }

    #[test]
    fn validate_rejects_direct_cycle() {
        let j = job(&[("a", &["a"])]);
        assert!(matches!(
            j.validate(),
            Err(GridError::CyclicDependency(_))
        ));
    }

    #[test]
    fn validate_rejects_indirect_cycle() {
        let j = job(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert!(matches!(
            j.validate(),
            Err(GridError::CyclicDependency(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let j = job(&[("a", &["ghost"])]);
        assert!(matches!(j.validate(), Err(GridError::InvalidJob(_))));
    }

    #[test]
    fn job_spec_deserializes_from_plain_json() {
        let j: Job = serde_json::from_str(
            r#"{ "steps": { "build": { "cmd": "make", "instances": 2 } } }"#,
        )
        .unwrap();
        assert_eq!(j.steps["build"].cmd, "make");
        assert_eq!(j.steps["build"].instances, 2);
        assert_eq!(j.steps["build"].concurrency, 1);
    }
}
