use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::lib::config::ControlPlaneConfig;
use crate::lib::fleet::registry::{FleetRegistry, InMemoryFleet};
use crate::lib::fleet::tests::server;
use crate::lib::fleet::types::NewWorkersGroup;
use crate::lib::manager::types::Dispatcher;
use crate::lib::tasks::clock::ManualClock;
use crate::lib::tasks::store::{InMemoryTaskStore, TaskFilter};
use crate::lib::tasks::types::{Module, State, TaskError, TaskId};
use crate::lib::worker::types::{LeaseProtocol, WorkerCapabilities};

pub(crate) const LEASE: Duration = Duration::from_secs(60);

/// Everything a dispatch test needs, wired to a manual clock.
pub(crate) struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub fleet: Arc<InMemoryFleet>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Dispatcher,
    pub leases: LeaseProtocol,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControlPlaneConfig::default().with_lease_duration(LEASE))
    }

    pub fn with_config(config: ControlPlaneConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let fleet = Arc::new(InMemoryFleet::new());
        fleet.add_server(server("s1", "edge-1"));
        fleet.add_server(server("s2", "edge-2"));
        let clock = Arc::new(ManualClock::new(1_000_000));

        let dispatcher = Dispatcher::new(store.clone(), fleet.clone(), clock.clone(), Arc::new(config));
        let leases = LeaseProtocol::new(store.clone(), clock.clone());

        Harness {
            store,
            fleet,
            clock,
            dispatcher,
            leases,
        }
    }

    pub fn enqueue(&self, target: &str, name: &str) -> TaskId {
        self.dispatcher
            .enqueue(target, "haproxy", "create-config", create_params(name), "root@example.com")
            .unwrap()
    }

    pub fn tick(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub(crate) fn create_params(name: &str) -> Value {
    json!({"name": name, "content": "bind *:80", "kind": 1})
}

pub(crate) fn haproxy_worker(id: &str) -> WorkerCapabilities {
    WorkerCapabilities::new(id, &[Module::Haproxy])
}

fn claimable_ids(h: &Harness, worker: &WorkerCapabilities) -> Vec<TaskId> {
    h.dispatcher.claimable(worker).map(|task| task.id).collect()
}

// ============================================================
// Enqueue
// ============================================================

#[test]
fn test_enqueue_creates_pending_task() {
    let h = Harness::new();
    let id = h
        .dispatcher
        .enqueue("s1", "haproxy", "create-config", create_params("web"), "ops@example.com")
        .unwrap();

    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.status, State::Pending);
    assert_eq!(task.target_id, "s1");
    assert_eq!(task.module(), Module::Haproxy);
    assert_eq!(task.username, "ops@example.com");
    assert_eq!(task.created_at, 1_000_000);
    assert_eq!(task.requeue_count, 0);
    assert!(task.lease_owner.is_none());
}

#[test]
fn test_enqueue_accepts_group_target() {
    let h = Harness::new();
    let group = h
        .fleet
        .create_group(NewWorkersGroup {
            name: "proxies".to_string(),
            server_id: "s1".to_string(),
            workers: vec![],
        })
        .unwrap();

    let id = h
        .dispatcher
        .enqueue(&group.id, "haproxy", "create-config", create_params("web"), "root")
        .unwrap();
    assert_eq!(h.dispatcher.get(&id).unwrap().target_id, group.id);
}

#[test]
fn test_enqueue_unknown_target() {
    let h = Harness::new();
    let err = h
        .dispatcher
        .enqueue("nope", "haproxy", "create-config", create_params("web"), "root")
        .unwrap_err();
    assert_eq!(err, TaskError::InvalidTarget("nope".to_string()));

    let err = h
        .dispatcher
        .enqueue("  ", "haproxy", "create-config", create_params("web"), "root")
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidTarget(_)));
    assert!(h.store.is_empty());
}

#[test]
fn test_enqueue_unknown_module_or_command() {
    let h = Harness::new();
    let err = h
        .dispatcher
        .enqueue("s1", "nginx", "create-config", create_params("web"), "root")
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));

    let err = h
        .dispatcher
        .enqueue("s1", "haproxy", "reload", create_params("web"), "root")
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));
    assert!(!err.is_retryable());
}

#[test]
fn test_enqueue_rejects_malformed_params() {
    let h = Harness::new();
    let err = h
        .dispatcher
        .enqueue("s1", "haproxy", "create-config", json!({"name": "web"}), "root")
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));

    let err = h
        .dispatcher
        .enqueue("s1", "haproxy", "remove-config", json!({}), "root")
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));
    assert!(h.store.is_empty());
}

// ============================================================
// Claimable
// ============================================================

#[test]
fn test_claimable_oldest_first_across_targets() {
    let h = Harness::new();
    let a = h.enqueue("s1", "a");
    h.tick(Duration::from_millis(1));
    let b = h.enqueue("s2", "b");

    let ids = claimable_ids(&h, &haproxy_worker("w1"));
    assert_eq!(ids, vec![a, b]);
}

#[test]
fn test_claimable_filters_by_module() {
    let h = Harness::new();
    h.enqueue("s1", "a");

    let no_modules = WorkerCapabilities::new("w1", &[]);
    assert!(claimable_ids(&h, &no_modules).is_empty());
    assert_eq!(claimable_ids(&h, &haproxy_worker("w1")).len(), 1);
}

#[test]
fn test_claimable_one_in_flight_per_slot() {
    let h = Harness::new();
    let a = h.enqueue("s1", "a");
    h.tick(Duration::from_millis(1));
    let b = h.enqueue("s1", "b");
    let worker = haproxy_worker("w1");

    // Only the head of the slot is offered.
    assert_eq!(claimable_ids(&h, &worker), vec![a.clone()]);

    // While A is in flight, nothing for s1/haproxy is offered.
    h.leases.claim(&a, "w1", LEASE).unwrap();
    assert!(claimable_ids(&h, &worker).is_empty());
    h.leases.start(&a, "w1").unwrap();
    assert!(claimable_ids(&h, &worker).is_empty());

    // Once A is terminal, B becomes the head.
    h.leases.complete(&a, "w1", json!({"ok": true})).unwrap();
    assert_eq!(claimable_ids(&h, &worker), vec![b]);
}

#[test]
fn test_claimable_is_lazy_snapshot() {
    let h = Harness::new();
    let a = h.enqueue("s1", "a");
    let mut candidates = h.dispatcher.claimable(&haproxy_worker("w1"));

    // Another worker takes the task after the snapshot was built.
    h.leases.claim(&a, "w2", LEASE).unwrap();

    let stale = candidates.next().unwrap();
    assert_eq!(stale.id, a);
    let err = h.leases.claim(&stale.id, "w1", LEASE).unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));
    assert!(candidates.next().is_none());
}

// ============================================================
// Listing
// ============================================================

#[test]
fn test_list_applies_default_and_global_limit() {
    let config = ControlPlaneConfig::default().with_limits(2, 3);
    let h = Harness::with_config(config);
    for i in 0..5 {
        h.dispatcher
            .enqueue("s1", "haproxy", "create-config", create_params(&format!("c{}", i)), "root")
            .unwrap();
        h.tick(Duration::from_millis(1));
    }

    assert_eq!(h.dispatcher.list(&TaskFilter::all(), None).len(), 2);
    assert_eq!(h.dispatcher.list(&TaskFilter::all(), Some(1)).len(), 1);
    assert_eq!(h.dispatcher.list(&TaskFilter::all(), Some(100)).len(), 3);

    let listed = h.dispatcher.list(&TaskFilter::all(), Some(3));
    assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[test]
fn test_list_filters_by_status() {
    let h = Harness::new();
    let a = h.enqueue("s1", "a");
    h.leases.claim(&a, "w1", LEASE).unwrap();

    let claimed = h.dispatcher.list(&TaskFilter::with_status(State::Claimed), None);
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, a);
    assert!(h.dispatcher.list(&TaskFilter::with_status(State::Done), None).is_empty());
}
