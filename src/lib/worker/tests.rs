use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use super::haproxy::register_haproxy_handlers;
use super::runner::{HANDLER_PANICKED, HandlerRegistry, WorkerAgent};
use crate::lib::config::ControlPlaneConfig;
use crate::lib::fleet::registry::FleetRegistry;
use crate::lib::manager::tests::{Harness, LEASE, haproxy_worker};
use crate::lib::monitor::monitor::Monitor;
use crate::lib::tasks::store::{Expected, TaskPatch, TaskStore};
use crate::lib::tasks::types::{
    Command, HaproxyCommand, LEASE_EXPIRED_TOO_MANY_TIMES, Module, State, Slot, Task, TaskError,
};

fn monitor(h: &Harness) -> Arc<Monitor> {
    Monitor::new(h.store.clone(), h.clock.clone(), 3, Duration::from_secs(5))
}

// ============================================================
// Claim
// ============================================================

#[test]
fn test_claim_sets_lease() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");

    let lease = h.leases.claim(&id, "w1", LEASE).unwrap();
    assert_eq!(lease.worker_id, "w1");
    assert_eq!(lease.expires_at, 1_000_000 + 60_000);
    assert_eq!(lease.task.status, State::Claimed);
    assert_eq!(lease.task.claimed_at, Some(1_000_000));

    let slot = Slot {
        target_id: "s1".to_string(),
        module: Module::Haproxy,
    };
    assert_eq!(h.store.slot_holder(&slot), Some(id));
}

#[test]
fn test_second_claim_conflicts() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");

    h.leases.claim(&id, "w1", LEASE).unwrap();
    let err = h.leases.claim(&id, "w2", LEASE).unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));
    assert!(err.is_retryable());

    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.lease_owner.as_deref(), Some("w1"));
}

#[test]
fn test_claim_out_of_order_conflicts() {
    let h = Harness::new();
    let first = h.enqueue("s1", "a");
    h.tick(Duration::from_millis(1));
    let second = h.enqueue("s1", "b");

    let err = h.leases.claim(&second, "w1", LEASE).unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));
    h.leases.claim(&first, "w1", LEASE).unwrap();
}

#[test]
fn test_claim_unknown_task() {
    let h = Harness::new();
    let err = h.leases.claim(&"missing".into(), "w1", LEASE).unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
}

#[test]
fn test_claims_on_different_targets_proceed_in_parallel() {
    let h = Harness::new();
    let a = h.enqueue("s1", "a");
    let b = h.enqueue("s2", "b");

    h.leases.claim(&a, "w1", LEASE).unwrap();
    h.leases.claim(&b, "w2", LEASE).unwrap();
}

#[test]
fn test_concurrent_claims_single_winner() {
    let h = Arc::new(Harness::new());
    let id = h.enqueue("s1", "web");
    let barrier = Arc::new(std::sync::Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let h = h.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                h.leases.claim(&id, &format!("w{}", i), LEASE).is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

// ============================================================
// Start / heartbeat / complete / fail
// ============================================================

#[test]
fn test_happy_path() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");

    h.leases.claim(&id, "w1", LEASE).unwrap();
    h.tick(Duration::from_secs(1));
    let started = h.leases.start(&id, "w1").unwrap();
    assert_eq!(started.task.status, State::Running);

    h.tick(Duration::from_secs(1));
    let done = h.leases.complete(&id, "w1", json!({"config_id": "c1"})).unwrap();
    assert_eq!(done.status, State::Done);
    assert_eq!(done.report, Some(json!({"config_id": "c1"})));
    assert_eq!(done.completed_at, Some(1_002_000));
    assert!(done.lease_owner.is_none());
    assert!(done.lease_expires_at.is_none());
}

#[test]
fn test_complete_from_claimed_conflicts() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    let err = h.leases.complete(&id, "w1", json!({})).unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));
    assert_eq!(h.dispatcher.get(&id).unwrap().status, State::Claimed);
}

#[test]
fn test_heartbeat_extends_and_promotes() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    h.tick(Duration::from_secs(30));
    let lease = h.leases.heartbeat(&id, "w1", LEASE).unwrap();
    assert_eq!(lease.expires_at, 1_030_000 + 60_000);
    assert_eq!(lease.task.status, State::Running);
}

#[test]
fn test_non_owner_is_refused() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    let err = h.leases.start(&id, "w2").unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id.clone()));
    let err = h.leases.heartbeat(&id, "w2", LEASE).unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id.clone()));
    let err = h.leases.fail(&id, "w2", Some("boom".into()), None).unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id.clone()));

    h.leases.start(&id, "w1").unwrap();
    let err = h.leases.complete(&id, "w2", json!({})).unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id.clone()));
    assert!(!err.is_retryable());

    // The lease is untouched.
    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.lease_owner.as_deref(), Some("w1"));
    assert_eq!(task.lease_expires_at, Some(1_060_000));
}

#[test]
fn test_heartbeat_on_pending_task_is_not_owner() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    let err = h.leases.heartbeat(&id, "w1", LEASE).unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id));
}

#[test]
fn test_fail_records_errors() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    let failed = h
        .leases
        .fail(&id, "w1", Some("config rejected".into()), Some("exit 1".into()))
        .unwrap();
    assert_eq!(failed.status, State::Failed);
    assert_eq!(failed.error.as_deref(), Some("config rejected"));
    assert_eq!(failed.internal_error.as_deref(), Some("exit 1"));
    assert!(failed.lease_owner.is_none());
}

#[test]
fn test_terminal_task_refuses_everything() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();
    h.leases.start(&id, "w1").unwrap();
    h.leases.complete(&id, "w1", json!({})).unwrap();

    assert!(matches!(h.leases.claim(&id, "w2", LEASE), Err(TaskError::Conflict { .. })));
    assert_eq!(
        h.leases.heartbeat(&id, "w1", LEASE).unwrap_err(),
        TaskError::NotOwner(id.clone())
    );
    assert_eq!(
        h.leases.fail(&id, "w2", None, None).unwrap_err(),
        TaskError::NotOwner(id.clone())
    );
    assert_eq!(h.dispatcher.get(&id).unwrap().status, State::Done);
}

// ============================================================
// Expiry
// ============================================================

#[test]
fn test_heartbeat_after_requeue_is_expired() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    h.tick(LEASE + Duration::from_secs(1));
    let report = monitor(&h).sweep();
    assert_eq!(report.requeued, 1);

    let err = h.leases.heartbeat(&id, "w1", LEASE).unwrap_err();
    assert_eq!(err, TaskError::Expired(id.clone()));
    assert!(err.is_retryable());

    // A different worker picks it up; the old owner stays locked out.
    h.leases.claim(&id, "w2", LEASE).unwrap();
    let err = h.leases.complete(&id, "w1", json!({})).unwrap_err();
    assert_eq!(err, TaskError::Expired(id.clone()));
    let err = h.leases.start(&id, "w3").unwrap_err();
    assert_eq!(err, TaskError::NotOwner(id));
}

#[test]
fn test_expired_owner_after_give_up() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    let monitor = monitor(&h);

    for _ in 0..4 {
        h.leases.claim(&id, "w1", LEASE).unwrap();
        h.tick(LEASE + Duration::from_secs(1));
        monitor.sweep();
    }

    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.status, State::Failed);
    assert_eq!(task.internal_error.as_deref(), Some(LEASE_EXPIRED_TOO_MANY_TIMES));
    assert_eq!(
        h.leases.heartbeat(&id, "w1", LEASE).unwrap_err(),
        TaskError::Expired(id)
    );
}

#[test]
fn test_owner_racing_the_store_gets_conflict() {
    let h = Harness::new();
    let id = h.enqueue("s1", "web");
    h.leases.claim(&id, "w1", LEASE).unwrap();

    // Something else moved the task on under the worker's feet.
    h.store
        .update(
            &id,
            TaskPatch::start(),
            &Expected::status(State::Claimed).owned_by("w1"),
        )
        .unwrap();
    let err = h.leases.start(&id, "w1").unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));
}

// ============================================================
// Agent
// ============================================================

fn agent(h: &Harness, worker_id: &str) -> Arc<WorkerAgent> {
    let handlers = HandlerRegistry::new();
    register_haproxy_handlers(&handlers, h.fleet.clone());
    WorkerAgent::new(worker_id, h.dispatcher.clone(), h.leases.clone(), handlers)
}

#[test]
fn test_handler_registry_modules() {
    let h = Harness::new();
    let handlers = HandlerRegistry::new();
    assert!(handlers.modules().is_empty());

    register_haproxy_handlers(&handlers, h.fleet.clone());
    assert_eq!(handlers.modules(), vec![Module::Haproxy]);
}

#[tokio::test]
async fn test_agent_runs_create_update_remove() {
    let h = Harness::new();
    let agent = agent(&h, "local-1");
    assert_eq!(agent.capabilities(), haproxy_worker("local-1"));

    let create = h.enqueue("s1", "frontend");
    assert_eq!(agent.poll_once().await, Some(create.clone()));

    let created = h.dispatcher.get(&create).unwrap();
    assert_eq!(created.status, State::Done);
    let config_id = created.report.as_ref().unwrap()["config_id"]
        .as_str()
        .unwrap()
        .to_string();
    let config = h.fleet.get_haproxy_config(&config_id).unwrap();
    assert_eq!(config.name, "frontend");
    assert_eq!(config.target_id, "s1");

    let update = h
        .dispatcher
        .enqueue(
            "s1",
            "haproxy",
            "update-config",
            json!({"id": config_id, "content": "bind *:443"}),
            "root",
        )
        .unwrap();
    assert_eq!(agent.poll_once().await, Some(update));
    assert_eq!(h.fleet.get_haproxy_config(&config_id).unwrap().content, "bind *:443");

    let remove = h
        .dispatcher
        .enqueue("s1", "haproxy", "remove-config", json!({"id": config_id}), "root")
        .unwrap();
    assert_eq!(agent.poll_once().await, Some(remove));
    assert!(h.fleet.get_haproxy_config(&config_id).is_err());

    assert_eq!(agent.poll_once().await, None);
}

#[tokio::test]
async fn test_agent_reports_handler_failure() {
    let h = Harness::new();
    let agent = agent(&h, "local-1");

    let id = h
        .dispatcher
        .enqueue("s1", "haproxy", "remove-config", json!({"id": "missing"}), "root")
        .unwrap();
    assert_eq!(agent.poll_once().await, Some(id.clone()));

    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.status, State::Failed);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_agent_skips_busy_slot() {
    let h = Harness::new();
    let agent = agent(&h, "local-1");

    let held = h.enqueue("s1", "a");
    h.leases.claim(&held, "remote", LEASE).unwrap();
    h.enqueue("s1", "b");

    assert_eq!(agent.poll_once().await, None);
}

#[tokio::test]
async fn test_agent_stops_on_shutdown() {
    let h = Harness::new();
    let agent = agent(&h, "local-1");
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(agent.run(rx));
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

async fn panicking_handler(task: Task) -> anyhow::Result<Value> {
    panic!("handler blew up on {}", task.id);
}

async fn stuck_handler(_task: Task) -> anyhow::Result<Value> {
    std::future::pending().await
}

fn agent_with(h: &Harness, handlers: Arc<HandlerRegistry>) -> Arc<WorkerAgent> {
    WorkerAgent::new("local-1", h.dispatcher.clone(), h.leases.clone(), handlers)
}

fn short_lease_harness() -> Harness {
    Harness::with_config(ControlPlaneConfig::default().with_lease_duration(Duration::from_millis(30)))
}

#[tokio::test]
async fn test_agent_fails_task_when_handler_panics() {
    let h = short_lease_harness();
    let handlers = HandlerRegistry::new();
    handlers.register(Command::Haproxy(HaproxyCommand::CreateConfig), panicking_handler);
    let agent = agent_with(&h, handlers);

    let id = h.enqueue("s1", "web");
    assert_eq!(agent.poll_once().await, Some(id.clone()));

    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.status, State::Failed);
    assert_eq!(task.internal_error.as_deref(), Some(HANDLER_PANICKED));
    assert!(task.lease_owner.is_none());

    // The slot is free for the next task on the target.
    let next = h.enqueue("s1", "api");
    h.leases.claim(&next, "w2", Duration::from_secs(60)).unwrap();
}

#[tokio::test]
async fn test_cancelled_agent_stops_renewing_its_lease() {
    let h = short_lease_harness();
    let handlers = HandlerRegistry::new();
    handlers.register(Command::Haproxy(HaproxyCommand::CreateConfig), stuck_handler);
    let agent = agent_with(&h, handlers);

    let id = h.enqueue("s1", "web");
    let running = tokio::spawn(async move { agent.poll_once().await });

    for _ in 0..200 {
        if h.dispatcher.get(&id).unwrap().status == State::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.dispatcher.get(&id).unwrap().status, State::Running);

    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    // A leaked renewal would keep pushing the deadline past the clock.
    h.tick(Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = monitor(&h).sweep();
    assert_eq!(report.requeued, 1);
    let task = h.dispatcher.get(&id).unwrap();
    assert_eq!(task.status, State::Pending);
    assert_eq!(task.requeue_count, 1);
}
