use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::types::{Lease, LeaseProtocol};
use crate::lib::tasks::clock::{Clock, duration_ms};
use crate::lib::tasks::store::{Expected, SortOrder, TaskFilter, TaskPatch, TaskStore};
use crate::lib::tasks::types::{State, Task, TaskError, TaskId, TaskResult};

impl LeaseProtocol {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        LeaseProtocol { store, clock }
    }

    /// `PENDING -> CLAIMED`. Exactly one of several racing callers wins;
    /// the rest get `Conflict` and should go back to `claimable`.
    pub fn claim(&self, task_id: &TaskId, worker_id: &str, lease_duration: Duration) -> TaskResult<Lease> {
        let task = self.store.get(task_id)?;
        if task.status != State::Pending {
            return Err(TaskError::conflict(
                task_id,
                format!("task is {}, not PENDING", task.status),
            ));
        }

        let head = self.store.list(
            &TaskFilter::with_status(State::Pending).slot(&task.slot()),
            1,
            SortOrder::OldestFirst,
        );
        if let Some(head) = head.first().filter(|head| head.id != task.id) {
            return Err(TaskError::conflict(
                task_id,
                format!("older task {} for the same target runs first", head.id),
            ));
        }

        let now = self.clock.now_ms();
        let expires_at = now.saturating_add(duration_ms(lease_duration));
        let claimed = self.store.update(
            task_id,
            TaskPatch::claim(worker_id, now, expires_at),
            &Expected::status(State::Pending),
        )?;

        tracing::info!(
            "Worker {} claimed task {} ({} on {})",
            worker_id,
            task_id,
            claimed.command,
            claimed.target_id
        );
        Ok(Lease::from_task(claimed, worker_id))
    }

    /// `CLAIMED -> RUNNING`.
    pub fn start(&self, task_id: &TaskId, worker_id: &str) -> TaskResult<Lease> {
        let task = self.transition(task_id, worker_id, &[State::Claimed], TaskPatch::start())?;
        tracing::debug!("Worker {} started task {}", worker_id, task_id);
        Ok(Lease::from_task(task, worker_id))
    }

    /// Pushes the lease deadline to `now + extend_by`. A heartbeat on a
    /// claimed task also marks it running.
    pub fn heartbeat(&self, task_id: &TaskId, worker_id: &str, extend_by: Duration) -> TaskResult<Lease> {
        let expires_at = self.clock.now_ms().saturating_add(duration_ms(extend_by));
        let task = self.transition(
            task_id,
            worker_id,
            &[State::Claimed, State::Running],
            TaskPatch::extend(expires_at),
        )?;
        tracing::trace!("Renewed lease for task {} until {}", task_id, expires_at);
        Ok(Lease::from_task(task, worker_id))
    }

    /// `RUNNING -> DONE`.
    pub fn complete(&self, task_id: &TaskId, worker_id: &str, report: Value) -> TaskResult<Task> {
        let now = self.clock.now_ms();
        let task = self.transition(
            task_id,
            worker_id,
            &[State::Running],
            TaskPatch::complete(now, report),
        )?;
        tracing::info!("Task {} completed by worker {}", task_id, worker_id);
        Ok(task)
    }

    /// `CLAIMED | RUNNING -> FAILED`.
    pub fn fail(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        error: Option<String>,
        internal_error: Option<String>,
    ) -> TaskResult<Task> {
        let now = self.clock.now_ms();
        let task = self.transition(
            task_id,
            worker_id,
            &[State::Claimed, State::Running],
            TaskPatch::fail(now, error, internal_error),
        )?;
        tracing::warn!(
            "Task {} failed on worker {}: {}",
            task_id,
            worker_id,
            task.error.as_deref().or(task.internal_error.as_deref()).unwrap_or("unknown error")
        );
        Ok(task)
    }

    fn transition(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        from: &[State],
        patch: TaskPatch,
    ) -> TaskResult<Task> {
        let expected = Expected::any_of(from).owned_by(worker_id);
        match self.store.update(task_id, patch, &expected) {
            Err(TaskError::Conflict { reason, .. }) => {
                tracing::debug!("Lease update on {} by {} refused: {}", task_id, worker_id, reason);
                Err(self.explain_conflict(task_id, worker_id, from))
            }
            other => other,
        }
    }

    /// Turns a bare store conflict into the protocol's answer for this
    /// worker, based on what the task looks like now.
    fn explain_conflict(&self, task_id: &TaskId, worker_id: &str, from: &[State]) -> TaskError {
        let task = match self.store.get(task_id) {
            Ok(task) => task,
            Err(e) => return e,
        };

        let owns_lease = task.lease_owner.as_deref() == Some(worker_id);
        match task.status {
            State::Claimed | State::Running if owns_lease && !from.contains(&task.status) => {
                TaskError::conflict(
                    task_id,
                    format!("task is {}, expected one of {:?}", task.status, from),
                )
            }
            State::Claimed | State::Running if owns_lease => {
                TaskError::conflict(task_id, "task changed concurrently, retry")
            }
            _ if task.expired_owners.iter().any(|owner| owner == worker_id) => {
                TaskError::Expired(task_id.clone())
            }
            // Finished tasks have no lease left to match.
            _ => TaskError::NotOwner(task_id.clone()),
        }
    }
}
