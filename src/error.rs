use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("lock \"{0}\" is held elsewhere")]
    LockContended(String),

    #[error("executor not reachable: {0}")]
    ExecutorUnreachable(String),

    #[error("cyclic step dependency involving \"{0}\"")]
    CyclicDependency(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("unknown policy \"{0}\"")]
    UnknownPolicy(String),

    #[error("task \"{0}\" did not signal readiness in time")]
    ForkTimeout(String),

    /// The coordination store is unreachable or rejected the operation.
    /// Store backends construct this; a failed cycle is logged and retried,
    /// never fatal.
    #[error("coordination store error: {0}")]
    Store(String),

    /// Transport-level failure reported by a mesh backend.
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;
