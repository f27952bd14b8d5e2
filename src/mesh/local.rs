use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::mesh::{ExecutorApi, Mesh, WorkerApi};

/// In-process capability registry.
#[derive(Default)]
pub struct LocalMesh {
    workers: Mutex<HashMap<String, Arc<dyn WorkerApi>>>,
    executors: Mutex<HashMap<String, Arc<dyn ExecutorApi>>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Mesh for LocalMesh {
    fn register_worker(&self, id: &str, api: Arc<dyn WorkerApi>) {
        self.workers.lock().unwrap().insert(id.to_string(), api);
    }

    fn unregister_worker(&self, id: &str) {
        self.workers.lock().unwrap().remove(id);
    }

    fn worker(&self, id: &str) -> Option<Arc<dyn WorkerApi>> {
        self.workers.lock().unwrap().get(id).cloned()
    }

    fn register_executor(&self, id: &str, api: Arc<dyn ExecutorApi>) {
        self.executors.lock().unwrap().insert(id.to_string(), api);
    }

    fn unregister_executor(&self, id: &str) {
        self.executors.lock().unwrap().remove(id);
    }

    fn executor(&self, id: &str) -> Option<Arc<dyn ExecutorApi>> {
        self.executors.lock().unwrap().get(id).cloned()
    }
}
