use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::lib::config::ControlPlaneConfig;
use crate::lib::fleet::registry::FleetRegistry;
use crate::lib::manager::types::{Claimable, Dispatcher};
use crate::lib::tasks::clock::Clock;
use crate::lib::tasks::store::{SortOrder, TaskFilter, TaskStore};
use crate::lib::tasks::types::{Command, State, Task, TaskError, TaskId, TaskResult};
use crate::lib::worker::types::WorkerCapabilities;

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        fleet: Arc<dyn FleetRegistry>,
        clock: Arc<dyn Clock>,
        config: Arc<ControlPlaneConfig>,
    ) -> Self {
        Dispatcher {
            store,
            fleet,
            clock,
            config,
        }
    }

    /// Enqueues a task from raw `module`/`cmd` names.
    pub fn enqueue(
        &self,
        target_id: &str,
        module: &str,
        cmd: &str,
        params: Value,
        username: &str,
    ) -> TaskResult<TaskId> {
        let command = Command::parse(module, cmd)?;
        self.enqueue_command(target_id, command, params, username)
    }

    pub fn enqueue_command(
        &self,
        target_id: &str,
        command: Command,
        params: Value,
        username: &str,
    ) -> TaskResult<TaskId> {
        let target_id = target_id.trim();
        if target_id.is_empty() || !self.fleet.target_exists(target_id) {
            return Err(TaskError::InvalidTarget(target_id.to_string()));
        }
        command.validate_params(&params)?;

        let task = Task::new(target_id, command, params, username, self.clock.now_ms());
        let task_id = self.store.create(task)?;

        tracing::info!(
            "Task {} enqueued: {} on target {} by {}",
            task_id,
            command,
            target_id,
            username
        );
        Ok(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> TaskResult<Task> {
        self.store.get(task_id)
    }

    /// Oldest-first listing; `limit` is resolved against the configured
    /// default and global cap.
    pub fn list(&self, filter: &TaskFilter, limit: Option<usize>) -> Vec<Task> {
        let limit = self.config.clamp_limit(limit);
        self.store.list(filter, limit, SortOrder::OldestFirst)
    }

    /// Pending tasks `capabilities` can run right now, oldest first.
    ///
    /// The result is a snapshot: a task it yields may be claimed by someone
    /// else before this worker gets to it, in which case `claim` answers
    /// `Conflict` and the worker moves on to the next candidate.
    pub fn claimable(&self, capabilities: &WorkerCapabilities) -> Claimable {
        let busy: HashSet<_> = self
            .store
            .list(&TaskFilter::in_flight(), usize::MAX, SortOrder::OldestFirst)
            .into_iter()
            .map(|task| task.slot())
            .collect();

        let pending = self.store.list(
            &TaskFilter::with_status(State::Pending),
            usize::MAX,
            SortOrder::OldestFirst,
        );

        tracing::trace!(
            "Worker {} polling: {} pending, {} slots busy",
            capabilities.worker_id,
            pending.len(),
            busy.len()
        );

        Claimable {
            pending: pending.into_iter(),
            busy,
            seen: HashSet::new(),
            modules: capabilities.modules.iter().copied().collect(),
        }
    }
}
