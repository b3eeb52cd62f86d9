//! Lease reaper.
//!
//! Sweeps claimed/running tasks whose lease deadline has passed. Each one
//! goes back to `PENDING` with its requeue count bumped, or, once the count
//! reaches `max_requeues`, to a terminal `FAILED` with
//! `internal_error = "lease_expired_too_many_times"`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::lib::tasks::clock::Clock;
use crate::lib::tasks::store::{Expected, SortOrder, TaskFilter, TaskPatch, TaskStore};
use crate::lib::tasks::types::{State, TaskError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    /// Expired when listed, but renewed or finished before the update.
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.skipped == 0
    }
}

pub struct Monitor {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    max_requeues: u32,
    sweep_interval: Duration,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        max_requeues: u32,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            max_requeues,
            sweep_interval,
        })
    }

    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let expired = self.store.list(
            &TaskFilter::in_flight().lease_expired_before(now),
            usize::MAX,
            SortOrder::OldestFirst,
        );

        let mut report = SweepReport::default();
        for task in expired {
            let Some(owner) = task.lease_owner.as_deref() else {
                continue;
            };

            // Only act if nobody renewed or finished the lease since we listed it.
            let expected = Expected::any_of(&[State::Claimed, State::Running])
                .owned_by(owner)
                .lease_expired_before(now);

            let give_up = task.requeue_count >= self.max_requeues;
            let patch = if give_up {
                TaskPatch::give_up(now)
            } else {
                TaskPatch::requeue(task.requeue_count + 1)
            };

            match self.store.update(&task.id, patch, &expected) {
                Ok(updated) if give_up => {
                    report.failed += 1;
                    tracing::warn!(
                        "Task {} failed: lease held by {} expired {} times",
                        updated.id,
                        owner,
                        updated.requeue_count + 1
                    );
                }
                Ok(updated) => {
                    report.requeued += 1;
                    tracing::warn!(
                        "Lease on task {} held by {} expired; requeued ({}/{})",
                        updated.id,
                        owner,
                        updated.requeue_count,
                        self.max_requeues
                    );
                }
                Err(TaskError::Conflict { reason, .. }) => {
                    report.skipped += 1;
                    tracing::debug!("Skipped expired task {}: {}", task.id, reason);
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!("Failed to reclaim task {}: {}", task.id, e);
                }
            }
        }

        report
    }

    /// Sweeps every `sweep_interval` until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Lease monitor started (interval {:?}, max requeues {})",
            self.sweep_interval,
            self.max_requeues
        );
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep();
                    if !report.is_empty() {
                        tracing::info!(
                            "Sweep: {} requeued, {} failed, {} skipped",
                            report.requeued,
                            report.failed,
                            report.skipped
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Lease monitor stopped");
    }
}
