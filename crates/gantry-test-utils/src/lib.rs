//! Shared test utilities for gantry integration tests.
//!
//! Provides operation/orchestration fixtures, scripted steps for driving
//! the manager deterministically, and a shared PostgreSQL instance for the
//! live-database tests (ignored by default). Two PostgreSQL modes:
//! - **`GANTRY_TEST_PG_URL`** set: use the external server directly.
//! - **No env var**: spin up a container via testcontainers, shared per
//!   test binary through a `OnceCell`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use gantry_core::step::{Step, StepResult};
use gantry_db::models::{
    ChildCounters, DeprovisionPayload, Operation, OperationPayload, Orchestration,
    OrchestrationKind, OrchestrationParameters, ProvisionPayload, TargetSelector,
    UpgradeRuntimePayload,
};
use gantry_db::pool;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A pending provisioning operation with a resolved runtime version.
pub fn provision_operation(instance_id: &str, plan: &str) -> Operation {
    let mut payload = ProvisionPayload::new(plan);
    payload.runtime_version = Some("2.4.0".to_string());
    Operation::new(instance_id, OperationPayload::Provision(payload))
}

/// A pending deprovisioning operation.
pub fn deprovision_operation(instance_id: &str, runtime_id: Option<Uuid>) -> Operation {
    Operation::new(
        instance_id,
        OperationPayload::Deprovision(DeprovisionPayload {
            plan: "azure".to_string(),
            runtime_id,
        }),
    )
}

/// A pending runtime-upgrade child of the given orchestration.
pub fn upgrade_runtime_operation(orchestration_id: Uuid, runtime_id: Uuid) -> Operation {
    let mut op = Operation::new(
        format!("inst-{runtime_id}"),
        OperationPayload::UpgradeRuntime(UpgradeRuntimePayload {
            runtime_id,
            target_version: "2.5.0".to_string(),
            previous_version: Some("2.4.0".to_string()),
        }),
    );
    op.orchestration_id = Some(orchestration_id);
    op
}

/// A pending runtime-upgrade orchestration targeting everything.
pub fn upgrade_orchestration(parallelism: u32) -> Orchestration {
    Orchestration::new(
        OrchestrationKind::UpgradeRuntime,
        OrchestrationParameters {
            targets: TargetSelector {
                include_all: true,
                ..TargetSelector::default()
            },
            parallelism,
            schedule: None,
            target_version: "2.5.0".to_string(),
        },
    )
}

/// Count children into a fresh counter set.
pub fn count_states(operations: &[Operation]) -> ChildCounters {
    let mut counters = ChildCounters::default();
    for op in operations {
        counters.record(op.state);
    }
    counters
}

// ---------------------------------------------------------------------------
// Scripted steps
// ---------------------------------------------------------------------------

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Done,
    Retry(Duration),
    Fail(&'static str),
}

/// A step that replays a fixed script of outcomes and records every
/// operation it was handed.
///
/// When the script runs dry, further invocations complete successfully;
/// that keeps happy-path pipelines short to write.
pub struct ScriptedStep {
    name: String,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Operation>>,
}

impl ScriptedStep {
    pub fn new(name: &str) -> Self {
        Self::with_script(name, [])
    }

    pub fn with_script(name: &str, script: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// How many times the step has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The operations handed to the step, in invocation order.
    pub fn seen(&self) -> Vec<Operation> {
        self.seen.lock().expect("scripted step poisoned").clone()
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, op: Operation) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("scripted step poisoned")
            .push(op.clone());

        let outcome = self
            .script
            .lock()
            .expect("scripted step poisoned")
            .pop_front()
            .unwrap_or(ScriptedOutcome::Done);

        match outcome {
            ScriptedOutcome::Done => StepResult::Done(op),
            ScriptedOutcome::Retry(delay) => StepResult::Retry(op, delay),
            ScriptedOutcome::Fail(reason) => StepResult::Fail(op, anyhow::anyhow!(reason)),
        }
    }
}

/// A step that panics on every invocation.
pub struct PanickingStep {
    pub message: &'static str,
}

#[async_trait]
impl Step for PanickingStep {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn run(&self, _op: Operation) -> StepResult {
        panic!("{}", self.message);
    }
}

// ---------------------------------------------------------------------------
// Shared PostgreSQL (live-database tests only)
// ---------------------------------------------------------------------------

struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("GANTRY_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("17")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a uniquely-named database with migrations applied. Returns
/// `(pool, db_name)`; call [`drop_test_db`] with the name afterwards.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database");

    let db_name = format!("gantry_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/{db_name}"))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database, terminating stray connections first.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database for cleanup");

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}
