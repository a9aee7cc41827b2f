//! Integration tests for the orchestration supervisor: campaign expansion,
//! wave admission, schedule gating, cancellation, and terminal derivation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use uuid::Uuid;

use gantry_core::events::{BrokerEvent, EventBus, EventKind};
use gantry_core::queue::{ExecuteOutcome, Executor, ProcessingQueue};
use gantry_core::resolver::{RuntimeRef, StaticRuntimeResolver};
use gantry_core::supervisor::OrchestrationSupervisor;
use gantry_db::memory::{InMemoryOperationStore, InMemoryOrchestrationStore};
use gantry_db::models::{
    OperationFilter, OperationKind, OperationState, OrchestrationState, ScheduleWindow,
};
use gantry_db::store::{OperationStore, OrchestrationStore};
use gantry_test_utils::{upgrade_orchestration, upgrade_runtime_operation};

const POLL: Duration = Duration::from_millis(50);

/// Records admitted child IDs without driving them anywhere.
struct AdmissionRecorder {
    seen: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl Executor for AdmissionRecorder {
    async fn execute(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome> {
        self.seen.lock().unwrap().push(id);
        Ok(ExecuteOutcome::Done)
    }
}

struct Fixture {
    operations: Arc<InMemoryOperationStore>,
    orchestrations: Arc<InMemoryOrchestrationStore>,
    supervisor: OrchestrationSupervisor,
    admitted: Arc<AdmissionRecorder>,
    child_queue: ProcessingQueue,
    events: EventBus,
}

fn fixture(runtimes: usize) -> Fixture {
    let operations = Arc::new(InMemoryOperationStore::new());
    let orchestrations = Arc::new(InMemoryOrchestrationStore::new());
    let events = EventBus::new();

    let resolver = Arc::new(StaticRuntimeResolver::new());
    for i in 0..runtimes {
        resolver.register(RuntimeRef {
            runtime_id: Uuid::new_v4(),
            instance_id: format!("inst-{i}"),
            cluster_name: format!("cluster-{i}"),
            region: "westeurope".to_string(),
            labels: Default::default(),
        });
    }

    let admitted = Arc::new(AdmissionRecorder {
        seen: Mutex::new(Vec::new()),
    });
    let child_queue = ProcessingQueue::new(
        "upgrade_runtime",
        Arc::clone(&admitted) as Arc<dyn Executor>,
        2,
    );

    let mut child_queues = HashMap::new();
    child_queues.insert(OperationKind::UpgradeRuntime, child_queue.handle());

    let supervisor = OrchestrationSupervisor::new(
        Arc::clone(&orchestrations) as Arc<dyn OrchestrationStore>,
        Arc::clone(&operations) as Arc<dyn OperationStore>,
        resolver,
        child_queues,
        events.clone(),
        POLL,
    );

    Fixture {
        operations,
        orchestrations,
        supervisor,
        admitted,
        child_queue,
        events,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn pending_campaign_expands_into_children() {
    let fx = fixture(3);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Requeue(Duration::ZERO));

    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.state, OrchestrationState::InProgress);
    assert_eq!(stored.counters.pending, 3);
    assert_eq!(stored.counters.total(), 3);

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    for child in &page.operations {
        assert_eq!(child.state, OperationState::Pending);
        assert_eq!(child.orchestration_id, Some(id));
        let payload = child.payload.as_upgrade_runtime().expect("upgrade payload");
        assert_eq!(payload.target_version, "2.5.0");
    }

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn expansion_skips_runtimes_that_already_have_children() {
    let fx = fixture(3);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    // A child left behind by a crash mid-expansion.
    let mut leftover = upgrade_runtime_operation(id, Uuid::new_v4());
    leftover.instance_id = "inst-1".to_string();
    fx.operations.insert(leftover).await.unwrap();

    fx.supervisor.process(id).await.unwrap();

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3, "no duplicate child for inst-1");

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn waves_admit_at_most_parallelism_children() {
    let fx = fixture(5);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    // Expansion tick, then one scan tick.
    fx.supervisor.process(id).await.unwrap();
    fx.supervisor.process(id).await.unwrap();
    settle().await;

    let admitted = fx.admitted.seen.lock().unwrap().clone();
    assert_eq!(admitted.len(), 2, "first wave is bounded by parallelism");

    // Children are untouched in the store (the recorder runs nothing), so
    // another scan re-admits the same stable prefix, not new children.
    fx.supervisor.process(id).await.unwrap();
    settle().await;
    let readmitted = fx.admitted.seen.lock().unwrap().clone();
    let unique: std::collections::HashSet<Uuid> = readmitted.iter().copied().collect();
    assert_eq!(unique.len(), 2, "the admitted prefix is stable across scans");

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn next_wave_is_released_as_children_settle() {
    let fx = fixture(3);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    fx.supervisor.process(id).await.unwrap();

    // First two children finish, the third is still pending.
    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    for child in page.operations.iter().take(2) {
        let mut done = child.clone();
        done.state = OperationState::Succeeded;
        done.finished_at = Some(Utc::now());
        fx.operations.update(done).await.unwrap();
    }

    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Requeue(POLL));
    settle().await;

    let admitted = fx.admitted.seen.lock().unwrap().clone();
    let remaining = page.operations[2].id;
    assert!(
        admitted.contains(&remaining),
        "freed slots admit the next pending child"
    );

    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.counters.succeeded, 2);
    assert_eq!(stored.counters.pending, 1);

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn closed_schedule_window_blocks_admission() {
    let fx = fixture(2);
    let mut orchestration = upgrade_orchestration(2);
    // A zero-length window admits nothing, ever.
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    orchestration.parameters.schedule = Some(ScheduleWindow {
        days: vec![],
        start: midnight,
        end: midnight,
    });
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    fx.supervisor.process(id).await.unwrap();
    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Requeue(POLL));
    settle().await;

    assert!(
        fx.admitted.seen.lock().unwrap().is_empty(),
        "no child released outside the window"
    );
    // Counters still refresh while the window is closed.
    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.counters.pending, 2);

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn campaign_succeeds_when_all_children_succeed() {
    let fx = fixture(2);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    let finished = Arc::new(Mutex::new(Vec::new()));
    {
        let finished = Arc::clone(&finished);
        fx.events
            .subscribe(EventKind::OrchestrationFinished, move |event| {
                if let BrokerEvent::OrchestrationFinished { state, .. } = event {
                    finished.lock().unwrap().push(*state);
                }
            });
    }

    fx.supervisor.process(id).await.unwrap();

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    for child in page.operations {
        let mut done = child;
        done.state = OperationState::Succeeded;
        done.finished_at = Some(Utc::now());
        fx.operations.update(done).await.unwrap();
    }

    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);

    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.state, OrchestrationState::Succeeded);
    assert_eq!(stored.counters.succeeded, 2);
    assert_eq!(stored.description, "all children succeeded");
    assert_eq!(
        *finished.lock().unwrap(),
        vec![OrchestrationState::Succeeded]
    );

    fx.child_queue.shutdown().await;
}

#[tokio::test]
async fn campaign_fails_when_any_child_failed() {
    let fx = fixture(2);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    fx.supervisor.process(id).await.unwrap();

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    let states = [OperationState::Failed, OperationState::Succeeded];
    for (child, state) in page.operations.into_iter().zip(states) {
        let mut done = child;
        done.state = state;
        done.finished_at = Some(Utc::now());
        fx.operations.update(done).await.unwrap();
    }

    fx.supervisor.process(id).await.unwrap();

    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.state, OrchestrationState::Failed);
    assert!(stored.description.contains("1 of 2 children failed"));

    fx.child_queue.shutdown().await;
}

/// Campaign cancel: pending children are canceled directly without running
/// steps; the in-progress child settles normally; the campaign reaches
/// `canceled` on the tick after nothing is left in flight.
#[tokio::test]
async fn canceling_campaign_drains_and_settles() {
    let fx = fixture(0);
    let mut orchestration = upgrade_orchestration(4);
    orchestration.state = OrchestrationState::Canceling;
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    for _ in 0..3 {
        fx.operations
            .insert(upgrade_runtime_operation(id, Uuid::new_v4()))
            .await
            .unwrap();
    }
    let mut running = upgrade_runtime_operation(id, Uuid::new_v4());
    running.state = OperationState::InProgress;
    let running_id = running.id;
    fx.operations.insert(running).await.unwrap();

    // First tick: pending children are canceled, the campaign stays
    // canceling because one child is still in flight.
    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Requeue(POLL));

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    let canceled: Vec<_> = page
        .operations
        .iter()
        .filter(|op| op.state == OperationState::Canceled)
        .collect();
    assert_eq!(canceled.len(), 3);
    for child in &canceled {
        assert!(child.finished_at.is_some());
        assert!(child.progress.is_empty(), "canceled children ran no steps");
        assert_eq!(child.description, "canceled by orchestration");
    }
    assert_eq!(
        fx.orchestrations.get(id).await.unwrap().state,
        OrchestrationState::Canceling
    );

    // The in-flight child completes normally.
    let mut running = fx.operations.get(running_id).await.unwrap();
    running.state = OperationState::Succeeded;
    running.finished_at = Some(Utc::now());
    fx.operations.update(running).await.unwrap();

    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);

    let stored = fx.orchestrations.get(id).await.unwrap();
    assert_eq!(stored.state, OrchestrationState::Canceled);
    assert_eq!(stored.counters.canceled, 3);
    assert_eq!(stored.counters.succeeded, 1);
    assert_eq!(stored.counters.in_progress, 0);

    fx.child_queue.shutdown().await;
}

/// Counter partition invariant: pending + in-progress + terminal equals
/// the child count after every refresh.
#[tokio::test]
async fn counters_partition_the_child_set() {
    let fx = fixture(4);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    fx.supervisor.process(id).await.unwrap();

    let page = fx
        .operations
        .list_by_orchestration(id, OperationFilter::default())
        .await
        .unwrap();
    let states = [
        OperationState::InProgress,
        OperationState::Succeeded,
        OperationState::Failed,
        OperationState::Pending,
    ];
    for (child, state) in page.operations.into_iter().zip(states) {
        if state == OperationState::Pending {
            continue;
        }
        let mut next = child;
        next.state = state;
        if state.is_terminal() {
            next.finished_at = Some(Utc::now());
        }
        fx.operations.update(next).await.unwrap();
    }

    fx.supervisor.process(id).await.unwrap();

    let stored = fx.orchestrations.get(id).await.unwrap();
    let c = stored.counters;
    assert_eq!(c.pending, 1);
    assert_eq!(c.in_progress, 1);
    assert_eq!(c.succeeded, 1);
    assert_eq!(c.failed, 1);
    assert_eq!(c.total(), 4);

    fx.child_queue.shutdown().await;
}

/// An orchestration in `retrying` is scanned like an in-progress one.
#[tokio::test]
async fn retrying_campaign_is_scanned() {
    let fx = fixture(0);
    let mut orchestration = upgrade_orchestration(1);
    orchestration.state = OrchestrationState::Retrying;
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    let mut child = upgrade_runtime_operation(id, Uuid::new_v4());
    child.state = OperationState::Succeeded;
    child.finished_at = Some(Utc::now());
    fx.operations.insert(child).await.unwrap();

    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);
    assert_eq!(
        fx.orchestrations.get(id).await.unwrap().state,
        OrchestrationState::Succeeded
    );

    fx.child_queue.shutdown().await;
}

/// A campaign whose resolver finds no runtimes succeeds immediately on its
/// first scan.
#[tokio::test]
async fn empty_campaign_succeeds() {
    let fx = fixture(0);
    let orchestration = upgrade_orchestration(2);
    let id = orchestration.id;
    fx.orchestrations.insert(orchestration).await.unwrap();

    fx.supervisor.process(id).await.unwrap();
    let outcome = fx.supervisor.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);
    assert_eq!(
        fx.orchestrations.get(id).await.unwrap().state,
        OrchestrationState::Succeeded
    );

    fx.child_queue.shutdown().await;
}
