//! Store-event reactions: converts put/delete bursts under the coordination
//! namespaces into debounced scheduler checks, so scheduling reacts to state
//! changes without busy-polling. A fixed-interval poll remains underneath as
//! a fallback for missed or coalesced events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::{keys, Store};

/// Trailing-edge debouncer with single-flight execution: a burst of calls
/// coalesces into one invocation after `delay`, and invocations never
/// overlap because the driving loop awaits each one.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn new<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(delay).await;
                // Everything queued during the window rides this invocation.
                while rx.try_recv().is_ok() {}
                action().await;
            }
        });
        Self { tx }
    }

    pub fn call(&self) {
        let _ = self.tx.send(());
    }
}

pub struct Watcher {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    config: NodeConfig,
}

impl Watcher {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>, config: NodeConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let scheduler = self.scheduler.clone();
        let check = Debouncer::new(self.config.debounce, move || {
            let scheduler = scheduler.clone();
            async move {
                if let Err(e) = scheduler.check().await {
                    tracing::warn!(error = %e, "Check failed");
                }
            }
        });

        let mut submitted = self.store.watch_prefix(keys::SUBMITTED_PREFIX).await?;
        let mut job_records = self.store.watch_prefix(keys::JOB_PREFIX).await?;
        let mut executors = self.store.watch_prefix(keys::EXECUTOR_PREFIX).await?;
        let mut poll = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                Some(_) = submitted.recv() => check.call(),
                Some(_) = job_records.recv() => check.call(),
                Some(_) = executors.recv() => check.call(),
                _ = poll.tick() => check.call(),
                _ = token.cancelled() => break,
            }
        }
        Ok(())
    }
}
