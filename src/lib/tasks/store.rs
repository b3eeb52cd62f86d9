//! Task records and the one concurrency primitive the protocol relies on:
//! a conditional update that only applies when the stored status (and,
//! optionally, the lease owner and deadline) still match what the caller
//! last read.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use super::state::valid_state_transition;
use super::types::{
    LEASE_EXPIRED_TOO_MANY_TIMES, Module, Slot, State, Task, TaskError, TaskId, TaskResult,
};

/// Fields a single update may change. Status changes that leave the
/// in-flight states clear the lease fields.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<State>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<u64>,
    pub claimed_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub requeue_count: Option<u32>,
    pub report: Option<Value>,
    pub error: Option<String>,
    pub internal_error: Option<String>,
    /// The current lease lapsed; its owner is recorded in `expired_owners`.
    pub expire_lease: bool,
}

impl TaskPatch {
    pub fn claim(owner: &str, now: u64, expires_at: u64) -> Self {
        TaskPatch {
            status: Some(State::Claimed),
            lease_owner: Some(owner.to_string()),
            lease_expires_at: Some(expires_at),
            claimed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn start() -> Self {
        TaskPatch {
            status: Some(State::Running),
            ..Default::default()
        }
    }

    /// Heartbeat: push the deadline out and make sure the task is running.
    pub fn extend(expires_at: u64) -> Self {
        TaskPatch {
            status: Some(State::Running),
            lease_expires_at: Some(expires_at),
            ..Default::default()
        }
    }

    pub fn complete(now: u64, report: Value) -> Self {
        TaskPatch {
            status: Some(State::Done),
            completed_at: Some(now),
            report: Some(report),
            ..Default::default()
        }
    }

    pub fn fail(now: u64, error: Option<String>, internal_error: Option<String>) -> Self {
        TaskPatch {
            status: Some(State::Failed),
            completed_at: Some(now),
            error,
            internal_error,
            ..Default::default()
        }
    }

    pub fn requeue(requeue_count: u32) -> Self {
        TaskPatch {
            status: Some(State::Pending),
            requeue_count: Some(requeue_count),
            expire_lease: true,
            ..Default::default()
        }
    }

    /// Terminal failure after too many lapsed leases.
    pub fn give_up(now: u64) -> Self {
        TaskPatch {
            status: Some(State::Failed),
            completed_at: Some(now),
            internal_error: Some(LEASE_EXPIRED_TOO_MANY_TIMES.to_string()),
            expire_lease: true,
            ..Default::default()
        }
    }

    fn apply(self, task: &mut Task) {
        if self.expire_lease {
            if let Some(owner) = task.lease_owner.take() {
                task.expired_owners.push(owner);
            }
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(owner) = self.lease_owner {
            task.lease_owner = Some(owner);
        }
        if let Some(deadline) = self.lease_expires_at {
            task.lease_expires_at = Some(deadline);
        }
        if let Some(claimed_at) = self.claimed_at {
            task.claimed_at = Some(claimed_at.max(task.created_at));
        }
        if let Some(completed_at) = self.completed_at {
            let floor = task.claimed_at.unwrap_or(task.created_at);
            task.completed_at = Some(completed_at.max(floor));
        }
        if let Some(count) = self.requeue_count {
            task.requeue_count = count;
        }
        if let Some(report) = self.report {
            task.report = Some(report);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(internal_error) = self.internal_error {
            task.internal_error = Some(internal_error);
        }

        if !task.status.is_in_flight() {
            task.lease_owner = None;
            task.lease_expires_at = None;
        }
    }
}

/// What the caller believes is stored. An update is refused with
/// `Conflict` unless every given condition still holds.
#[derive(Debug, Clone)]
pub struct Expected {
    pub statuses: Vec<State>,
    pub lease_owner: Option<String>,
    /// Lease deadline must be strictly before this instant.
    pub lease_expired_before: Option<u64>,
}

impl Expected {
    pub fn status(status: State) -> Self {
        Self::any_of(&[status])
    }

    pub fn any_of(statuses: &[State]) -> Self {
        Expected {
            statuses: statuses.to_vec(),
            lease_owner: None,
            lease_expired_before: None,
        }
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.lease_owner = Some(owner.to_string());
        self
    }

    pub fn lease_expired_before(mut self, now: u64) -> Self {
        self.lease_expired_before = Some(now);
        self
    }

    fn check(&self, task: &Task) -> Result<(), String> {
        if !self.statuses.contains(&task.status) {
            return Err(format!(
                "expected status {:?}, found {}",
                self.statuses, task.status
            ));
        }

        if let Some(owner) = &self.lease_owner {
            if task.lease_owner.as_deref() != Some(owner.as_str()) {
                return Err(format!(
                    "expected lease owner {}, found {:?}",
                    owner, task.lease_owner
                ));
            }
        }

        if let Some(now) = self.lease_expired_before {
            if !task.lease_expired(now) {
                return Err("lease is still live".to_string());
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<State>>,
    pub target_id: Option<String>,
    pub module: Option<Module>,
    pub lease_expired_before: Option<u64>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: State) -> Self {
        TaskFilter {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn in_flight() -> Self {
        TaskFilter {
            statuses: Some(vec![State::Claimed, State::Running]),
            ..Default::default()
        }
    }

    pub fn slot(mut self, slot: &Slot) -> Self {
        self.target_id = Some(slot.target_id.clone());
        self.module = Some(slot.module);
        self
    }

    pub fn lease_expired_before(mut self, now: u64) -> Self {
        self.lease_expired_before = Some(now);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(target_id) = &self.target_id {
            if &task.target_id != target_id {
                return false;
            }
        }
        if let Some(module) = self.module {
            if task.module() != module {
                return false;
            }
        }
        if let Some(now) = self.lease_expired_before {
            if !task.lease_expired(now) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

pub trait TaskStore: Send + Sync {
    fn create(&self, task: Task) -> TaskResult<TaskId>;

    fn get(&self, id: &TaskId) -> TaskResult<Task>;

    /// Tasks matching `filter`, ordered by `(created_at, seq)`.
    fn list(&self, filter: &TaskFilter, limit: usize, sort: SortOrder) -> Vec<Task>;

    /// Applies `patch` only if `expected` still describes the stored task.
    /// Returns the updated record.
    fn update(&self, id: &TaskId, patch: TaskPatch, expected: &Expected) -> TaskResult<Task>;
}

/// `DashMap`-backed store. The `in_flight` map plays the role of a partial
/// unique index on `(target_id, module)` over claimed/running tasks.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, Task>,
    in_flight: DashMap<Slot, TaskId>,
    next_seq: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task currently holding `slot`, if any.
    #[cfg(test)]
    pub fn slot_holder(&self, slot: &Slot) -> Option<TaskId> {
        self.in_flight.get(slot).map(|holder| holder.value().clone())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, mut task: Task) -> TaskResult<TaskId> {
        if task.status != State::Pending {
            return Err(TaskError::conflict(
                &task.id,
                format!("new tasks must be PENDING, got {}", task.status),
            ));
        }

        let id = task.id.clone();
        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => Err(TaskError::conflict(&id, "task id already exists")),
            Entry::Vacant(vacant) => {
                task.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                vacant.insert(task);
                tracing::debug!("Stored task {}", id);
                Ok(id)
            }
        }
    }

    fn get(&self, id: &TaskId) -> TaskResult<Task> {
        self.tasks
            .get(id)
            .map(|task| task.value().clone())
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    fn list(&self, filter: &TaskFilter, limit: usize, sort: SortOrder) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        tasks.sort_by_key(|task| (task.created_at, task.seq));
        if sort == SortOrder::NewestFirst {
            tasks.reverse();
        }
        tasks.truncate(limit);
        tasks
    }

    fn update(&self, id: &TaskId, patch: TaskPatch, expected: &Expected) -> TaskResult<Task> {
        // Holding the record's write guard makes check-and-apply atomic.
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;

        let current = task.status;
        if current.is_terminal() {
            return Err(TaskError::conflict(id, format!("task is already {}", current)));
        }

        expected
            .check(&task)
            .map_err(|reason| TaskError::conflict(id, reason))?;

        let next = patch.status.unwrap_or(current);
        if !valid_state_transition(&current, &next) {
            return Err(TaskError::conflict(
                id,
                format!("invalid transition {} -> {}", current, next),
            ));
        }

        let slot = task.slot();
        if next.is_in_flight() && !current.is_in_flight() {
            match self.in_flight.entry(slot.clone()) {
                Entry::Occupied(holder) if holder.get() != id => {
                    return Err(TaskError::conflict(
                        id,
                        format!(
                            "task {} is already in flight for {}/{}",
                            holder.get(),
                            slot.target_id,
                            slot.module
                        ),
                    ));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(vacant) => {
                    vacant.insert(id.clone());
                }
            }
        } else if current.is_in_flight() && !next.is_in_flight() {
            self.in_flight.remove_if(&slot, |_, holder| holder == id);
        }

        patch.apply(&mut task);
        Ok(task.clone())
    }
}
