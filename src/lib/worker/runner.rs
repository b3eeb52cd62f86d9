//! In-process worker agent.
//!
//! Drives the lease protocol the same way an external worker does over
//! HTTP: poll `claimable`, `claim` the first candidate that does not
//! conflict, `start` it, run the registered handler while a sidecar keeps
//! the lease alive, then `complete` or `fail`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::watch;

use super::types::{Lease, LeaseProtocol, WorkerCapabilities};
use crate::lib::manager::types::Dispatcher;
use crate::lib::tasks::types::{Command, Module, Task, TaskId};

/// Async handler for one command. Resolves to the task's report.
pub type CommandHandler = Arc<dyn Fn(Task) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<Command, CommandHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, Fut>(&self, command: Command, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler_fn: CommandHandler = Arc::new(move |task: Task| handler(task).boxed());
        self.handlers.insert(command, handler_fn);
        tracing::info!("Registered handler for {}", command);
    }

    /// Modules for which at least one command has a handler.
    pub fn modules(&self) -> Vec<Module> {
        let mut modules: Vec<Module> = self.handlers.iter().map(|entry| entry.key().module()).collect();
        modules.sort_by_key(|m| m.as_str());
        modules.dedup();
        modules
    }

    pub async fn execute(&self, task: Task) -> anyhow::Result<Value> {
        // Clone the handler out so no map guard is held across the await.
        let handler = self.handlers.get(&task.command).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(task).await,
            None => Err(anyhow::anyhow!("no handler registered for {}", task.command)),
        }
    }
}

pub const HANDLER_PANICKED: &str = "handler panicked";

/// Stops the lease renewal sidecar however the owning future ends.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct WorkerAgent {
    pub worker_id: String,
    dispatcher: Dispatcher,
    leases: LeaseProtocol,
    handlers: Arc<HandlerRegistry>,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl WorkerAgent {
    pub fn new(
        worker_id: &str,
        dispatcher: Dispatcher,
        leases: LeaseProtocol,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        let lease_duration = dispatcher.config.lease_duration;
        let poll_interval = dispatcher.config.worker_poll_interval;
        Arc::new(Self {
            worker_id: worker_id.to_string(),
            dispatcher,
            leases,
            handlers,
            lease_duration,
            poll_interval,
        })
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities::new(&self.worker_id, &self.handlers.modules())
    }

    /// Polls until `shutdown` flips to `true`. A task already being
    /// executed is finished before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Worker {} started", self.worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.poll_once().await.is_none() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Worker {} stopped", self.worker_id);
    }

    /// Claims and executes at most one task. Returns the id of the task
    /// it ran, or `None` when nothing could be claimed.
    pub async fn poll_once(&self) -> Option<TaskId> {
        let capabilities = self.capabilities();
        for candidate in self.dispatcher.claimable(&capabilities) {
            match self.leases.claim(&candidate.id, &self.worker_id, self.lease_duration) {
                Ok(lease) => {
                    let task_id = lease.task_id.clone();
                    self.execute_with_lease(lease).await;
                    return Some(task_id);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Task {} not claimable: {}", candidate.id, e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Failed to claim task {}: {}", candidate.id, e);
                    continue;
                }
            }
        }
        None
    }

    async fn execute_with_lease(&self, lease: Lease) {
        let task_id = lease.task_id.clone();

        if let Err(e) = self.leases.start(&task_id, &self.worker_id) {
            tracing::warn!("Could not start task {}: {}", task_id, e);
            return;
        }

        let renewal = AbortOnDrop(self.spawn_lease_renewal(&task_id));
        let handlers = self.handlers.clone();
        let result = tokio::spawn(async move { handlers.execute(lease.task).await }).await;
        drop(renewal);

        let outcome = match result {
            Ok(Ok(report)) => self.leases.complete(&task_id, &self.worker_id, report),
            Ok(Err(e)) => self
                .leases
                .fail(&task_id, &self.worker_id, Some(e.to_string()), None),
            Err(e) => {
                tracing::error!("Handler for task {} did not finish: {}", task_id, e);
                let reason = if e.is_panic() { HANDLER_PANICKED } else { "handler cancelled" };
                self.leases
                    .fail(&task_id, &self.worker_id, None, Some(reason.to_string()))
            }
        };

        if let Err(e) = outcome {
            // The lease lapsed mid-run; the monitor owns the task now.
            tracing::warn!("Lost lease on task {} before reporting: {}", task_id, e);
        }
    }

    /// Heartbeats at a third of the lease duration until aborted or the
    /// lease is lost.
    fn spawn_lease_renewal(&self, task_id: &TaskId) -> tokio::task::JoinHandle<()> {
        let leases = self.leases.clone();
        let task_id = task_id.clone();
        let worker_id = self.worker_id.clone();
        let lease_duration = self.lease_duration;
        let period = (lease_duration / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                if let Err(e) = leases.heartbeat(&task_id, &worker_id, lease_duration) {
                    tracing::debug!("Stopped renewing lease on task {}: {}", task_id, e);
                    break;
                }
            }
        })
    }
}
