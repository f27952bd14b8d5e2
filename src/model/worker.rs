use serde::{Deserialize, Serialize};

use crate::resource::{Resource, Usage};

/// A fleet node's self-published heartbeat record. Ephemeral: exists in the
/// store only while the owning lease is renewed, which makes its
/// disappearance the crash-detection signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    /// Declared total capacity.
    pub total: Resource,
    /// Aggregated draw of the tasks currently running on this worker,
    /// in wall-clock ticks.
    #[serde(default)]
    pub usage: Usage,
}

impl Worker {
    /// Capacity-fit check: the published draw combined with `demand` (already
    /// offset to wall-clock ticks) must stay below `total` at every sample.
    pub fn verify(&self, demand: &Usage) -> bool {
        Usage::merge([&self.usage, demand]).below(&self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_fitting_demand() {
        let worker = Worker {
            id: "w1".into(),
            total: Resource::scalar("cpu", 4.0),
            usage: Usage::new()
                .with(0, Resource::scalar("cpu", 2.0))
                .with(1_000, Resource::scalar("cpu", 2.0)),
        };
        let demand = Usage::new()
            .with(0, Resource::scalar("cpu", 2.0))
            .with(500, Resource::scalar("cpu", 2.0));
        assert!(worker.verify(&demand));
    }

    #[test]
    fn verify_rejects_overcommit_at_any_tick() {
        let worker = Worker {
            id: "w1".into(),
            total: Resource::scalar("cpu", 4.0),
            usage: Usage::new()
                .with(0, Resource::scalar("cpu", 2.0))
                .with(1_000, Resource::scalar("cpu", 2.0)),
        };
        let demand = Usage::new()
            .with(500, Resource::scalar("cpu", 2.5))
            .with(800, Resource::scalar("cpu", 2.5));
        assert!(!worker.verify(&demand));
    }

    #[test]
    fn verify_with_no_published_usage() {
        let worker = Worker {
            id: "w1".into(),
            total: Resource::scalar("cpu", 1.0),
            usage: Usage::new(),
        };
        let fits = Usage::new().with(0, Resource::scalar("cpu", 1.0));
        assert!(worker.verify(&fits));
        let too_big = Usage::new().with(0, Resource::scalar("cpu", 1.5));
        assert!(!worker.verify(&too_big));
    }
}
