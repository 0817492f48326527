//! Tests for steward-dispatch: task lifecycle, wait/notify, long polls, adventure runs

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steward_core::config::TaskConfig;
use steward_core::{task_key, Entity, EntityId, Error, ManualClock, Result, TaskState};
use steward_dispatch::*;
use steward_fleet::{AdventureCatalog, FactGraph};
use steward_store::TypedStore;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000;

struct Harness {
    clock: Arc<ManualClock>,
    coordinator: Arc<DispatchCoordinator>,
    ledger: Arc<TaskLedger>,
    graph: Arc<FactGraph>,
    catalog: Arc<AdventureCatalog>,
}

fn harness() -> Harness {
    let store = Arc::new(TypedStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let coordinator = Arc::new(DispatchCoordinator::new());
    let ledger = Arc::new(
        TaskLedger::with_clock(
            &store,
            coordinator.clone(),
            &TaskConfig::default(),
            clock.clone(),
        )
        .unwrap(),
    );
    let graph = Arc::new(FactGraph::new(store).unwrap());
    let catalog = Arc::new(AdventureCatalog::new(graph.clone()).unwrap());
    Harness {
        clock,
        coordinator,
        ledger,
        graph,
        catalog,
    }
}

fn values(v: Value) -> Entity {
    Entity::from_value(v).unwrap()
}

fn pending(h: &Harness, node_id: EntityId) -> Task {
    h.ledger.submit(node_id, "run", json!({"cmd": "uptime"})).unwrap()
}

// ===========================================================================
// Task creation
// ===========================================================================

#[test]
fn create_with_required_fields_only() {
    let h = harness();
    let task = h
        .ledger
        .create(values(json!({"node_id": 1, "action": "run", "payload": {}})))
        .unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.submitted, T0);
    assert_eq!(task.completed, None);
    assert_eq!(task.expires, None);
    assert_eq!(task.result, None);
}

#[test]
fn create_honors_supplied_non_terminal_state() {
    let h = harness();
    let task = h
        .ledger
        .create(values(json!({
            "node_id": 1, "action": "run", "payload": {}, "state": "running", "completed": 5
        })))
        .unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert_eq!(task.completed, None);
}

#[test]
fn create_requires_fields() {
    let h = harness();
    let err = h
        .ledger
        .create(values(json!({"node_id": 1, "payload": {}})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .ledger
        .create(values(json!({"node_id": 1, "action": "run", "payload": {}, "state": "bogus"})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn create_ignores_caller_submitted() {
    let h = harness();
    let task = h
        .ledger
        .create(values(json!({"node_id": 1, "action": "run", "payload": {}, "submitted": 1})))
        .unwrap();
    assert_eq!(task.submitted, T0);
}

#[test]
fn extra_attributes_pass_through() {
    let h = harness();
    let task = h
        .ledger
        .create(values(json!({"node_id": 1, "action": "run", "payload": {}, "origin": "cli"})))
        .unwrap();
    assert_eq!(task.extra.get("origin"), Some(&json!("cli")));
    let doc = serde_json::to_value(&task).unwrap();
    assert_eq!(doc["origin"], json!("cli"));
    assert_eq!(doc["state"], json!("pending"));
}

// ===========================================================================
// State machine
// ===========================================================================

#[test]
fn terminal_transition_stamps_completed() {
    let h = harness();
    let task = pending(&h, 1);
    h.clock.advance(30);
    let done = h
        .ledger
        .update(task.id, values(json!({"state": "done", "completed": 12, "result": {"ok": true}})))
        .unwrap();
    assert_eq!(done.state, TaskState::Done);
    assert_eq!(done.completed, Some(T0 + 30));
    assert_eq!(done.result, Some(json!({"ok": true})));
}

#[test]
fn non_terminal_transition_leaves_completed_null() {
    let h = harness();
    let task = pending(&h, 1);
    let running = h
        .ledger
        .update(task.id, values(json!({"state": "running"})))
        .unwrap();
    assert_eq!(running.state, TaskState::Running);
    assert_eq!(running.completed, None);
}

#[test]
fn every_terminal_state_stamps() {
    for state in ["done", "error", "cancelled"] {
        let h = harness();
        let task = pending(&h, 1);
        let updated = h.ledger.update(task.id, values(json!({"state": state}))).unwrap();
        assert!(updated.state.is_terminal());
        assert_eq!(updated.completed, Some(T0), "state {}", state);
    }
}

#[test]
fn submitted_is_never_rewritten() {
    let h = harness();
    let task = pending(&h, 1);
    h.clock.advance(100);
    let mut round_trip = Entity::from_value(serde_json::to_value(&task).unwrap()).unwrap();
    round_trip.insert("submitted", json!(42));
    let updated = h.ledger.update(task.id, round_trip).unwrap();
    assert_eq!(updated.submitted, T0);
    assert_eq!(h.ledger.get(task.id).unwrap().submitted, T0);
}

#[test]
fn nothing_leaves_a_terminal_state() {
    let h = harness();
    let task = pending(&h, 1);
    h.ledger.update(task.id, values(json!({"state": "done"}))).unwrap();
    for next in ["pending", "running", "error"] {
        let err = h
            .ledger
            .update(task.id, values(json!({"state": next})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }), "{}", next);
    }
}

#[test]
fn running_cannot_go_back() {
    let h = harness();
    let task = pending(&h, 1);
    h.ledger.update(task.id, values(json!({"state": "running"}))).unwrap();
    for next in ["pending", "delivered"] {
        let err = h
            .ledger
            .update(task.id, values(json!({"state": next})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }
}

#[test]
fn same_state_rewrite_does_not_restamp() {
    let h = harness();
    let task = pending(&h, 1);
    h.ledger.update(task.id, values(json!({"state": "error"}))).unwrap();
    h.clock.advance(60);
    let again = h
        .ledger
        .update(task.id, values(json!({"state": "error", "result": "oops"})))
        .unwrap();
    assert_eq!(again.completed, Some(T0));
    assert_eq!(again.result, Some(json!("oops")));
}

#[test]
fn failed_transition_changes_nothing() {
    let h = harness();
    let task = pending(&h, 1);
    h.ledger.update(task.id, values(json!({"state": "done"}))).unwrap();
    let before = h.ledger.get(task.id).unwrap();
    h.ledger
        .update(task.id, values(json!({"state": "pending", "result": "x"})))
        .unwrap_err();
    assert_eq!(h.ledger.get(task.id).unwrap(), before);
}

#[test]
fn update_and_delete_missing_task() {
    let h = harness();
    assert!(h
        .ledger
        .update(9, values(json!({"state": "done"})))
        .unwrap_err()
        .is_not_found());
    assert!(h.ledger.delete(9).unwrap_err().is_not_found());
}

// ===========================================================================
// Claiming
// ===========================================================================

#[test]
fn peek_does_not_mutate() {
    let h = harness();
    let first = pending(&h, 1);
    pending(&h, 1);
    pending(&h, 2);
    let peeked = h.ledger.claim_next_pending(1).unwrap();
    assert_eq!(peeked.id, first.id);
    assert_eq!(h.ledger.get(first.id).unwrap().state, TaskState::Pending);
    assert!(h.ledger.claim_next_pending(3).is_none());
}

#[test]
fn second_claim_conflicts() {
    let h = harness();
    let task = pending(&h, 1);
    h.ledger.claim(task.id, TaskState::Delivered).unwrap();
    let err = h.ledger.claim(task.id, TaskState::Running).unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn concurrent_claims_have_one_winner() {
    let h = harness();
    let id = pending(&h, 1).id;
    let ledger = &h.ledger;
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(move || ledger.claim(id, TaskState::Delivered)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(Error::is_conflict));
    assert!(h.ledger.claim_next_pending(1).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_split_tasks() {
    let h = harness();
    for _ in 0..20 {
        pending(&h, 1);
    }
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let ledger = h.ledger.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = ledger.deliver_next(1).unwrap() {
                    mine.push(task.id);
                }
                mine
            })
        })
        .collect();
    let mut delivered: Vec<EntityId> = futures::future::join_all(workers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    delivered.sort();
    let before = delivered.len();
    delivered.dedup();
    assert_eq!(before, 20);
    assert_eq!(delivered.len(), 20);
}

#[test]
fn deliver_next_marks_delivered() {
    let h = harness();
    let task = pending(&h, 4);
    let delivered = h.ledger.deliver_next(4).unwrap().unwrap();
    assert_eq!(delivered.id, task.id);
    assert_eq!(delivered.state, TaskState::Delivered);
    assert!(h.ledger.deliver_next(4).unwrap().is_none());
}

// ===========================================================================
// Retention
// ===========================================================================

#[test]
fn listing_prunes_old_terminal_tasks() {
    let h = harness();
    let done = pending(&h, 1);
    let running = pending(&h, 1);
    let fresh = pending(&h, 1);
    h.ledger.update(done.id, values(json!({"state": "done"}))).unwrap();
    h.ledger
        .update(running.id, values(json!({"state": "running"})))
        .unwrap();

    h.clock.advance(1_000);
    h.ledger.update(fresh.id, values(json!({"state": "done"}))).unwrap();
    assert_eq!(h.ledger.list().len(), 3);

    h.clock.advance(1_000);
    let ids: Vec<EntityId> = h.ledger.list().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![running.id, fresh.id]);
    assert!(h.ledger.get(done.id).unwrap_err().is_not_found());
}

// ===========================================================================
// Wait / notify
// ===========================================================================

#[tokio::test]
async fn notify_before_wait_still_wakes_registered_waiter() {
    let h = harness();
    let mut waiter = h.coordinator.waiter("k");
    assert_eq!(h.coordinator.notify("k"), 1);
    assert_eq!(
        waiter.wait(Duration::from_millis(10)).await,
        WaitOutcome::Signaled
    );
    assert_eq!(
        h.coordinator.wait("k", Duration::from_millis(10)).await,
        WaitOutcome::Signaled
    );
}

#[tokio::test]
async fn notify_without_waiter_leaves_no_signal() {
    let h = harness();
    drop(h.coordinator.waiter("k"));
    assert_eq!(h.coordinator.notify("k"), 0);
    assert_eq!(
        h.coordinator.wait("k", Duration::from_millis(50)).await,
        WaitOutcome::TimedOut
    );
}

#[tokio::test]
async fn clear_prevents_false_wake() {
    let h = harness();
    let mut waiter = h.coordinator.waiter("k");
    h.coordinator.notify("k");
    assert_eq!(waiter.wait(Duration::from_millis(10)).await, WaitOutcome::Signaled);
    h.coordinator.clear("k");
    assert_eq!(waiter.wait(Duration::from_millis(50)).await, WaitOutcome::TimedOut);
}

#[tokio::test]
async fn shared_key_waiters_each_see_the_notify() {
    let h = harness();
    let key = task_key(3);
    let mut a = h.coordinator.waiter(&key);
    let mut b = h.coordinator.waiter(&key);
    pending(&h, 3);
    assert_eq!(a.wait(Duration::from_millis(10)).await, WaitOutcome::Signaled);
    h.coordinator.clear(&key);
    assert_eq!(b.wait(Duration::from_millis(200)).await, WaitOutcome::Signaled);
    assert!(h.ledger.claim_next_pending(3).is_some());
}

#[tokio::test]
async fn keys_are_independent() {
    let h = harness();
    let mut a = h.coordinator.waiter("a");
    let _b = h.coordinator.waiter("b");
    h.coordinator.notify("b");
    assert_eq!(a.wait(Duration::from_millis(50)).await, WaitOutcome::TimedOut);
}

#[tokio::test]
async fn wait_wakes_on_later_notify() {
    let h = harness();
    let coordinator = h.coordinator.clone();
    let mut waiter = coordinator.waiter("k");
    let notifier = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.notify("k")
    });
    assert_eq!(waiter.wait(Duration::from_secs(5)).await, WaitOutcome::Signaled);
    assert_eq!(notifier.await.unwrap(), 1);
}

// ===========================================================================
// Long poll
// ===========================================================================

#[tokio::test]
async fn long_poll_returns_existing_task_immediately() {
    let h = harness();
    let task = pending(&h, 1);
    let found = h.ledger.long_poll(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(found.map(|t| t.id), Some(task.id));
}

#[tokio::test]
async fn long_poll_times_out_empty() {
    let h = harness();
    let started = std::time::Instant::now();
    let found = h.ledger.long_poll(1, Duration::from_millis(100)).await.unwrap();
    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_poll_wakes_when_task_is_created() {
    let h = harness();
    let ledger = h.ledger.clone();
    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ledger.submit(7, "run", json!({})).unwrap()
    });
    let started = std::time::Instant::now();
    let found = h
        .ledger
        .long_poll_deliver(7, Duration::from_secs(10), &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let created = producer.await.unwrap();
    assert_eq!(found.id, created.id);
    assert_eq!(found.state, TaskState::Delivered);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_poll_wakes_on_retarget() {
    let h = harness();
    let task = pending(&h, 1);
    let ledger = h.ledger.clone();
    let mover = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ledger
            .update(task.id, Entity::from_value(json!({"node_id": 2})).unwrap())
            .unwrap()
    });
    let found = h.ledger.long_poll(2, Duration::from_secs(10)).await.unwrap();
    mover.await.unwrap();
    assert_eq!(found.map(|t| t.id), Some(task.id));
}

#[tokio::test]
async fn cancelled_poll_leaves_task_claimable() {
    let h = harness();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let found = h
        .ledger
        .long_poll_deliver(3, Duration::from_secs(10), &cancel)
        .await
        .unwrap();
    assert!(found.is_none());

    let task = pending(&h, 3);
    assert_eq!(h.ledger.deliver_next(3).unwrap().map(|t| t.id), Some(task.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_pollers_split_one_task() {
    let h = harness();
    let pollers: Vec<_> = (0..2)
        .map(|_| {
            let ledger = h.ledger.clone();
            tokio::spawn(async move {
                ledger
                    .long_poll_deliver(5, Duration::from_millis(400), &CancellationToken::new())
                    .await
                    .unwrap()
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pending(&h, 5);

    let results = futures::future::join_all(pollers).await;
    let got = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Some(_))))
        .count();
    assert_eq!(got, 1);
    assert_eq!(h.coordinator.waiting(&task_key(5)), 0);
}

// ===========================================================================
// Adventure runs
// ===========================================================================

fn node(h: &Harness, name: &str, backends: Value) -> EntityId {
    h.graph
        .create_node(values(json!({"name": name, "facts": {"backends": backends}})))
        .unwrap()
        .id()
}

fn runner(h: &Harness, solver: Arc<dyn Solver>) -> AdventureRunner {
    AdventureRunner::new(h.catalog.clone(), h.ledger.clone(), solver, "adventurator")
}

#[test]
fn run_adventure_needs_an_adventurator() {
    let h = harness();
    let web = node(&h, "web1", json!(["node"]));
    let err = runner(&h, Arc::new(PlanOnlySolver))
        .run_adventure(json!({"steps": []}), &[web])
        .unwrap_err();
    assert!(matches!(err, Error::NoCapableNode(ref c) if c == "adventurator"));
}

#[test]
fn run_adventure_rejects_empty_node_list() {
    let h = harness();
    node(&h, "adv", json!(["node", "adventurator"]));
    let err = runner(&h, Arc::new(PlanOnlySolver))
        .run_adventure(json!({}), &[])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn run_adventure_passes_node_ids_through() {
    let h = harness();
    let adv = node(&h, "adv", json!(["node", "adventurator"]));
    let rack = node(&h, "rack", json!(["node", "container"]));
    let web = h
        .graph
        .create_node(values(json!({"name": "web1", "facts": {"parent_id": rack}})))
        .unwrap()
        .id();

    let task = runner(&h, Arc::new(PlanOnlySolver))
        .run_adventure(json!({"steps": ["reboot"]}), &[rack, web])
        .unwrap();
    assert_eq!(task.node_id, adv);
    assert_eq!(task.action, "adventurate");
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(
        task.payload,
        json!({
            "adventure_dsl": {"steps": ["reboot"]},
            "nodes": [rack, web],
            "globals": {"solved_adventure": true, "defined_adventure": false},
        })
    );
}

#[test]
fn run_adventure_accepts_empty_container() {
    let h = harness();
    node(&h, "adv", json!(["adventurator"]));
    let rack = node(&h, "rack", json!(["node", "container"]));
    let task = runner(&h, Arc::new(PlanOnlySolver))
        .run_adventure(json!({}), &[rack])
        .unwrap();
    assert_eq!(task.payload["nodes"], json!([rack]));
}

#[test]
fn run_adventure_rejects_unknown_node() {
    let h = harness();
    let adv = node(&h, "adv", json!(["adventurator"]));
    let err = runner(&h, Arc::new(PlanOnlySolver))
        .run_adventure(json!({}), &[404])
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h.ledger.claim_next_pending(adv).is_none());
}

#[test]
fn run_defined_adventure_uses_catalog_dsl() {
    let h = harness();
    let adv = node(&h, "adv", json!(["adventurator"]));
    let web = node(&h, "web1", json!(["node"]));
    let adventure = h
        .catalog
        .create(values(json!({"name": "upgrade", "criteria": "true", "dsl": {"steps": ["apt"]}})))
        .unwrap();

    let task = runner(&h, Arc::new(PlanOnlySolver))
        .run_defined_adventure(adventure.id().unwrap(), &[web])
        .unwrap();
    assert_eq!(task.node_id, adv);
    assert_eq!(task.payload["adventure_dsl"], json!({"steps": ["apt"]}));
    assert_eq!(task.payload["globals"]["defined_adventure"], json!(true));
    assert!(runner(&h, Arc::new(PlanOnlySolver))
        .run_defined_adventure(99, &[web])
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn plan_only_solver_needs_input_for_constraints() {
    let h = harness();
    node(&h, "adv", json!(["adventurator"]));
    let web = node(&h, "web1", json!(["node"]));
    let runner = runner(&h, Arc::new(PlanOnlySolver));

    let outcome = runner
        .solve_and_run(web, &["facts.os = 'ubuntu'".to_string()], None)
        .await
        .unwrap();
    assert!(outcome.solve.requires_input);
    assert!(outcome.task.is_none());

    let outcome = runner
        .solve_and_run(web, &[], Some(json!({"steps": ["x"]})))
        .await
        .unwrap();
    assert!(outcome.solve.solvable);
    let task = outcome.task.unwrap();
    assert_eq!(task.payload["nodes"], json!([web]));
}

struct FixedSolver;

#[async_trait]
impl Solver for FixedSolver {
    async fn solve(&self, node_id: EntityId, constraints: &[String]) -> Result<SolveOutcome> {
        Ok(SolveOutcome {
            solvable: true,
            requires_input: false,
            plan: json!({"node": node_id, "goals": constraints}),
        })
    }
}

#[tokio::test]
async fn solvable_plans_become_tasks() {
    let h = harness();
    let adv = node(&h, "adv", json!(["adventurator"]));
    let web = node(&h, "web1", json!(["node"]));
    let runner = runner(&h, Arc::new(FixedSolver));

    let solved = runner
        .solve_for_node(web, &["role = 'web'".to_string()])
        .await
        .unwrap();
    assert_eq!(solved.plan["goals"], json!(["role = 'web'"]));
    assert!(h.ledger.claim_next_pending(adv).is_none());

    let outcome = runner
        .solve_and_run(web, &["role = 'web'".to_string()], None)
        .await
        .unwrap();
    let task = outcome.task.unwrap();
    assert_eq!(task.node_id, adv);
    assert_eq!(h.ledger.claim_next_pending(adv).map(|t| t.id), Some(task.id));
}

#[tokio::test]
async fn solving_for_missing_node_is_not_found() {
    let h = harness();
    let runner = runner(&h, Arc::new(FixedSolver));
    assert!(runner.solve_for_node(77, &[]).await.unwrap_err().is_not_found());
}

struct NeedsInputSolver;

#[async_trait]
impl Solver for NeedsInputSolver {
    async fn solve(&self, _node_id: EntityId, _constraints: &[String]) -> Result<SolveOutcome> {
        Ok(SolveOutcome {
            solvable: true,
            requires_input: true,
            plan: json!({"steps": ["ask"]}),
        })
    }
}

#[tokio::test]
async fn solvable_plan_runs_even_when_input_is_requested() {
    let h = harness();
    let adv = node(&h, "adv", json!(["adventurator"]));
    let web = node(&h, "web1", json!(["node"]));
    let outcome = runner(&h, Arc::new(NeedsInputSolver))
        .solve_and_run(web, &[], None)
        .await
        .unwrap();
    assert!(outcome.solve.requires_input);
    let task = outcome.task.unwrap();
    assert_eq!(task.node_id, adv);
    assert_eq!(task.payload["adventure_dsl"], json!({"steps": ["ask"]}));
}
