use std::collections::HashSet;
use std::sync::Arc;

use crate::lib::config::ControlPlaneConfig;
use crate::lib::fleet::registry::FleetRegistry;
use crate::lib::tasks::clock::Clock;
use crate::lib::tasks::store::TaskStore;
use crate::lib::tasks::types::{Module, Slot, Task};

/// Producer-facing side of the protocol: validates and enqueues tasks,
/// and decides which pending tasks a polling worker may claim.
///
/// Every collaborator is injected; nothing is read from global state.
#[derive(Clone)]
pub struct Dispatcher {
    pub store: Arc<dyn TaskStore>,
    pub fleet: Arc<dyn FleetRegistry>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ControlPlaneConfig>,
}

/// Lazy view over the pending queue for one worker.
///
/// Yields at most one task per `(target_id, module)`: the oldest pending
/// one, and only when nothing for that pair is claimed or running.
pub struct Claimable {
    pub(super) pending: std::vec::IntoIter<Task>,
    pub(super) busy: HashSet<Slot>,
    pub(super) seen: HashSet<Slot>,
    pub(super) modules: HashSet<Module>,
}

impl Iterator for Claimable {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        for task in self.pending.by_ref() {
            let slot = task.slot();
            // Everything after the first pending task of a slot waits its turn.
            if !self.seen.insert(slot.clone()) {
                continue;
            }
            if self.modules.contains(&slot.module) && !self.busy.contains(&slot) {
                return Some(task);
            }
        }
        None
    }
}
