//! Store key layout. Everything the system persists lives under these
//! namespaces; the prefixes are also what the watcher subscribes to.

pub const SUBMITTED_PREFIX: &str = "submited/";
pub const JOB_PREFIX: &str = "job/";
pub const EXECUTOR_PREFIX: &str = "executor/";

pub fn submitted(job: &str) -> String {
    format!("{SUBMITTED_PREFIX}{job}")
}

pub fn success_prefix(job: &str) -> String {
    format!("job/{job}/success/")
}

pub fn success(job: &str, step: &str) -> String {
    format!("job/{job}/success/{step}")
}

pub fn started_prefix(job: &str, step: &str) -> String {
    format!("job/{job}/started/{step}/")
}

pub fn started(job: &str, step: &str, task: &str) -> String {
    format!("job/{job}/started/{step}/{task}")
}

pub fn worker(id: &str) -> String {
    format!("worker/{id}")
}

pub fn tagged_prefix(tag: &str) -> String {
    format!("tagged/{tag}/")
}

pub fn tagged(tag: &str, worker: &str) -> String {
    format!("tagged/{tag}/{worker}")
}

pub fn worker_tags_prefix(worker: &str) -> String {
    format!("worker/{worker}/tags/")
}

pub fn worker_tag(worker: &str, tag: &str) -> String {
    format!("worker/{worker}/tags/{tag}")
}

pub fn executor_prefix(job: &str) -> String {
    format!("executor/{job}/")
}

pub fn executor(job: &str, task: &str) -> String {
    format!("executor/{job}/{task}")
}

pub fn working_prefix(worker: &str) -> String {
    format!("working/{worker}/")
}

pub fn working(worker: &str, task: &str) -> String {
    format!("working/{worker}/{task}")
}

pub fn dispatch_lock(worker: &str) -> String {
    format!("dispatch-worker/{worker}")
}

pub fn update_lock(job: &str) -> String {
    format!("update/{job}")
}

pub fn kill_lock(task: &str) -> String {
    format!("check-task/{task}")
}

/// Final path segment of a key, e.g. the task id of a started record.
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
