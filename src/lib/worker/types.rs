use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lib::tasks::clock::Clock;
use crate::lib::tasks::store::TaskStore;
use crate::lib::tasks::types::{Module, Task, TaskId};

/// What a polling worker declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    pub modules: Vec<Module>,
}

impl WorkerCapabilities {
    pub fn new(worker_id: &str, modules: &[Module]) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            modules: modules.to_vec(),
        }
    }
}

/// A worker's time-bounded exclusive hold on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub worker_id: String,
    pub expires_at: u64,
    pub task: Task,
}

impl Lease {
    pub fn from_task(task: Task, worker_id: &str) -> Self {
        Lease {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            expires_at: task.lease_expires_at.unwrap_or_default(),
            task,
        }
    }
}

/// Worker-facing side of the protocol. Each operation is one conditional
/// store update keyed by task id, expected status and expected owner.
#[derive(Clone)]
pub struct LeaseProtocol {
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
}
