//! Integration tests for the operation manager: step ordering, retry and
//! failure classification, timeout, cancellation, and panic containment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use gantry_core::events::{BrokerEvent, EventBus, EventKind};
use gantry_core::manager::{OperationManager, DEFAULT_OPERATION_TIMEOUT, TIMEOUT_REASON};
use gantry_core::queue::ExecuteOutcome;
use gantry_core::step::{Step, StepRegistry};
use gantry_db::memory::InMemoryOperationStore;
use gantry_db::models::{Operation, OperationState};
use gantry_db::store::OperationStore;
use gantry_test_utils::{provision_operation, PanickingStep, ScriptedOutcome, ScriptedStep};

fn manager(store: &Arc<InMemoryOperationStore>, registry: StepRegistry) -> OperationManager {
    OperationManager::new(
        Arc::clone(store) as Arc<dyn OperationStore>,
        registry,
        EventBus::new(),
        DEFAULT_OPERATION_TIMEOUT,
    )
}

fn manager_with_events(
    store: &Arc<InMemoryOperationStore>,
    registry: StepRegistry,
    events: EventBus,
) -> OperationManager {
    OperationManager::new(
        Arc::clone(store) as Arc<dyn OperationStore>,
        registry,
        events,
        DEFAULT_OPERATION_TIMEOUT,
    )
}

async fn insert(store: &InMemoryOperationStore, op: Operation) -> Uuid {
    let id = op.id;
    store.insert(op).await.unwrap();
    id
}

/// Happy provision: every step runs exactly once, in weight order.
#[tokio::test]
async fn happy_pipeline_runs_each_step_once() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));
    let b = Arc::new(ScriptedStep::new("b"));
    let create = Arc::new(ScriptedStep::new("create"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.register_arc(2, b.clone(), None);
    registry.register_arc(10, create.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    let outcome = manager.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert!(op.finished_at.is_some());
    assert_eq!(op.progress.len(), 3);
    for name in ["a", "b", "create"] {
        assert!(op.progress.contains_key(name), "missing marker for {name}");
    }
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(create.calls(), 1);

    // Steps saw each other's results in weight order.
    assert!(a.seen()[0].progress.is_empty());
    assert!(b.seen()[0].progress.contains_key("a"));
    assert!(create.seen()[0].progress.contains_key("b"));
}

/// Transient retry: the step is re-invoked with exactly the operation it
/// persisted, and earlier steps are not repeated.
#[tokio::test]
async fn transient_retry_reinvokes_only_that_step() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));
    let b = Arc::new(ScriptedStep::with_script(
        "b",
        [ScriptedOutcome::Retry(Duration::from_millis(50))],
    ));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.register_arc(2, b.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    let outcome = manager.process(id).await.unwrap();
    assert_eq!(
        outcome,
        ExecuteOutcome::Requeue(Duration::from_millis(50))
    );
    assert_eq!(b.calls(), 1);

    let persisted = store.get(id).await.unwrap();
    assert_eq!(persisted.state, OperationState::InProgress);

    let outcome = manager.process(id).await.unwrap();
    assert_eq!(outcome, ExecuteOutcome::Done);
    assert_eq!(a.calls(), 1, "completed step must not rerun");
    assert_eq!(b.calls(), 2);

    // The re-invocation saw the operation exactly as persisted.
    let second_sight = &b.seen()[1];
    assert_eq!(second_sight.version, persisted.version);
    assert!(second_sight.progress.contains_key("a"));

    assert_eq!(
        store.get(id).await.unwrap().state,
        OperationState::Succeeded
    );
}

/// Permanent failure mid-pipeline: later steps never run, the reason lands
/// in the description.
#[tokio::test]
async fn permanent_failure_stops_the_pipeline() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));
    let b = Arc::new(ScriptedStep::with_script(
        "b",
        [ScriptedOutcome::Fail("quota exceeded in region")],
    ));
    let create = Arc::new(ScriptedStep::new("create"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.register_arc(2, b.clone(), None);
    registry.register_arc(10, create.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    assert_eq!(manager.process(id).await.unwrap(), ExecuteOutcome::Done);

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("quota"));
    assert!(op.finished_at.is_some());
    assert_eq!(create.calls(), 0);
    assert_eq!(op.progress.len(), 1);
    assert!(op.progress.contains_key("a"));
}

/// An operation past its deadline fails on dispatch without running any
/// step.
#[tokio::test]
async fn expired_operation_fails_before_any_step() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);

    let manager = manager(&store, registry);

    let mut op = provision_operation("inst-1", "azure");
    op.created_at = Utc::now() - chrono::Duration::hours(25);
    let id = insert(&store, op).await;

    assert_eq!(manager.process(id).await.unwrap(), ExecuteOutcome::Done);

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert_eq!(op.description, TIMEOUT_REASON);
    assert!(op.finished_at.is_some());
    assert_eq!(a.calls(), 0);
}

/// Terminal operations are absorbing: reprocessing runs nothing.
#[tokio::test]
async fn succeeded_operation_is_never_reprocessed() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    manager.process(id).await.unwrap();
    assert_eq!(a.calls(), 1);

    for _ in 0..3 {
        assert_eq!(manager.process(id).await.unwrap(), ExecuteOutcome::Done);
    }
    assert_eq!(a.calls(), 1);
}

/// A cancel written to the store while a step holds the operation wins the
/// version race; the manager drops its stale write and runs nothing more.
#[tokio::test]
async fn external_cancel_aborts_the_pipeline() {
    struct CancelingStep {
        store: Arc<InMemoryOperationStore>,
    }

    #[async_trait::async_trait]
    impl Step for CancelingStep {
        fn name(&self) -> &str {
            "canceled_underfoot"
        }

        async fn run(&self, op: gantry_db::models::Operation) -> gantry_core::step::StepResult {
            // Simulates the cancellation surface writing directly to the
            // store while this step is in flight.
            let mut current = self.store.get(op.id).await.unwrap();
            current.state = OperationState::Canceled;
            current.finished_at = Some(Utc::now());
            current.updated_at = Utc::now();
            self.store.update(current).await.unwrap();
            gantry_core::step::StepResult::Done(op)
        }
    }

    let store = Arc::new(InMemoryOperationStore::new());
    let b = Arc::new(ScriptedStep::new("b"));

    let mut registry = StepRegistry::new();
    registry.register_arc(
        1,
        Arc::new(CancelingStep {
            store: Arc::clone(&store),
        }),
        None,
    );
    registry.register_arc(2, b.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    assert_eq!(manager.process(id).await.unwrap(), ExecuteOutcome::Done);

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Canceled);
    assert_eq!(b.calls(), 0);
    assert!(op.progress.is_empty(), "stale progress write must be dropped");
}

/// Panics inside a step are contained and classified as permanent
/// failures.
#[tokio::test]
async fn step_panic_is_a_permanent_failure() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));
    let c = Arc::new(ScriptedStep::new("c"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.register_arc(
        2,
        Arc::new(PanickingStep {
            message: "boom in the event hub",
        }),
        None,
    );
    registry.register_arc(3, c.clone(), None);

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    assert_eq!(manager.process(id).await.unwrap(), ExecuteOutcome::Done);

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("panicked"));
    assert!(op.description.contains("boom in the event hub"));
    assert_eq!(c.calls(), 0);
    assert_eq!(a.calls(), 1);
}

/// The init step leads the plan and gets a progress marker like any other
/// step.
#[tokio::test]
async fn init_step_runs_first_and_is_recorded() {
    let store = Arc::new(InMemoryOperationStore::new());
    let init = Arc::new(ScriptedStep::new("initialization"));
    let a = Arc::new(ScriptedStep::new("a"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.set_init_arc(init.clone());

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    manager.process(id).await.unwrap();

    assert_eq!(init.calls(), 1);
    assert!(init.seen()[0].progress.is_empty());
    assert!(a.seen()[0].progress.contains_key("initialization"));

    let op = store.get(id).await.unwrap();
    assert!(op.progress.contains_key("initialization"));
    assert_eq!(op.state, OperationState::Succeeded);
}

/// Skip predicates suppress a step without recording progress for it.
#[tokio::test]
async fn skip_predicate_suppresses_the_step() {
    let store = Arc::new(InMemoryOperationStore::new());
    let a = Arc::new(ScriptedStep::new("a"));
    let trial_only = Arc::new(ScriptedStep::new("trial_only"));

    let mut registry = StepRegistry::new();
    registry.register_arc(1, a.clone(), None);
    registry.register_arc(
        2,
        trial_only.clone(),
        Some(Arc::new(|op: &Operation| op.plan() != Some("trial"))),
    );

    let manager = manager(&store, registry);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;

    manager.process(id).await.unwrap();

    let op = store.get(id).await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert_eq!(trial_only.calls(), 0);
    assert!(!op.progress.contains_key("trial_only"));
    assert!(op.progress.contains_key("a"));
}

/// The manager publishes step and terminal events in order.
#[tokio::test]
async fn events_track_the_pipeline() {
    let store = Arc::new(InMemoryOperationStore::new());
    let events = EventBus::new();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    for kind in [
        EventKind::StepProcessed,
        EventKind::OperationSucceeded,
        EventKind::OperationFailed,
    ] {
        let log = Arc::clone(&log);
        events.subscribe(kind, move |event| {
            let tag = match event {
                BrokerEvent::StepProcessed { step, .. } => format!("step:{step}"),
                BrokerEvent::OperationSucceeded { .. } => "succeeded".to_string(),
                BrokerEvent::OperationFailed { .. } => "failed".to_string(),
                other => format!("{:?}", other.kind()),
            };
            log.lock().unwrap().push(tag);
        });
    }

    let mut registry = StepRegistry::new();
    registry.register_arc(1, Arc::new(ScriptedStep::new("a")), None);
    registry.register_arc(2, Arc::new(ScriptedStep::new("b")), None);

    let manager = manager_with_events(&store, registry, events);
    let id = insert(&store, provision_operation("inst-1", "azure")).await;
    manager.process(id).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["step:a", "step:b", "succeeded"]
    );
}
