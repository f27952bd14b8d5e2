use std::time::Duration;

use rand::Rng;

use crate::resource::{Quantity, Resource};

/// Configuration for the worker role: which tags this node advertises and the
/// capacity it offers to the scheduler.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tags published to the tag index (the implicit `any` tag is always
    /// added on top of these).
    pub tags: Vec<String>,
    /// Total declared capacity. The scheduler and the worker's own
    /// authoritative check both verify projected usage against this.
    pub total: Resource,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            tags: Vec::new(),
            total: Resource::new().with("cpu", Quantity::Scalar(cores as f64)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node id; doubles as the worker id for the worker role.
    pub node_id: String,
    /// TTL for every lease this node owns (heartbeats, tag index entries).
    /// Loops must renew strictly more often than this.
    pub lease_ttl: Duration,
    /// Fixed interval of the periodic poll loops (lease renewal, heartbeat
    /// publication, fallback scheduler check).
    pub poll_interval: Duration,
    /// Bounded wait for a forked task process to acknowledge readiness.
    pub fork_timeout: Duration,
    /// Trailing-debounce window used when coalescing store events.
    pub debounce: Duration,
    /// Grace period between SIGTERM and SIGKILL when terminating a task's
    /// process group.
    pub kill_grace: Duration,
    /// Planning horizon for the default usage policy: a step without a
    /// declared curve is assumed to draw its `res` constantly for this long.
    pub plan_horizon_ms: i64,
    pub worker: WorkerConfig,
}

/// Random hex-8 id, used when a node or submitted job does not name one.
pub fn random_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: random_id(),
            lease_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            fork_timeout: Duration::from_secs(10),
            debounce: Duration::from_millis(1_000),
            kill_grace: Duration::from_secs(5),
            plan_horizon_ms: 60 * 60 * 1_000,
            worker: WorkerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.worker.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_total(mut self, total: Resource) -> Self {
        self.worker.total = total;
        self
    }
}
