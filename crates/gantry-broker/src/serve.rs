//! Broker startup wiring: stores, queues, supervisor, recovery, and the
//! two HTTP listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gantry_core::events::EventBus;
use gantry_core::manager::OperationManager;
use gantry_core::provisioner::{LocalProvisioner, RuntimeProvisioner};
use gantry_core::queue::{ProcessingQueue, QueueHandle};
use gantry_core::recovery::RecoveryLoader;
use gantry_core::resolver::{RuntimeResolver, StaticRuntimeResolver};
use gantry_core::supervisor::{OrchestrationSupervisor, DEFAULT_POLLING_INTERVAL};
use gantry_db::config::DbConfig;
use gantry_db::memory::{InMemoryOperationStore, InMemoryOrchestrationStore};
use gantry_db::models::OperationKind;
use gantry_db::pool;
use gantry_db::postgres::{PgOperationStore, PgOrchestrationStore};
use gantry_db::store::{OperationStore, OrchestrationStore};

use crate::api::{self, AppState};
use crate::config::BrokerConfig;
use crate::metrics::Metrics;
use crate::pipelines;

pub async fn run_serve(config: BrokerConfig) -> Result<()> {
    let events = EventBus::new();
    let metrics = Metrics::new();
    metrics.attach(&events);

    let (operations, orchestrations): (Arc<dyn OperationStore>, Arc<dyn OrchestrationStore>) =
        if config.db_in_memory {
            info!("running with in-memory stores");
            (
                Arc::new(InMemoryOperationStore::new()),
                Arc::new(InMemoryOrchestrationStore::new()),
            )
        } else {
            let db_config = DbConfig::from_env();
            let db_pool = pool::create_pool(&db_config).await?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
            (
                Arc::new(PgOperationStore::new(db_pool.clone())),
                Arc::new(PgOrchestrationStore::new(db_pool)),
            )
        };

    // Hyperscaler-specific provisioners and the catalog-backed resolver
    // implement these traits out of tree and are swapped in here.
    let provisioner: Arc<dyn RuntimeProvisioner> = Arc::new(LocalProvisioner::default());
    let resolver: Arc<dyn RuntimeResolver> = Arc::new(StaticRuntimeResolver::new());

    // One manager and one worker pool per operation kind, so provisioning,
    // deprovisioning, and upgrade traffic cannot starve each other.
    let mut operation_queues: HashMap<OperationKind, QueueHandle> = HashMap::new();
    let mut pools: Vec<ProcessingQueue> = Vec::new();
    for kind in OperationKind::ALL {
        let registry = pipelines::registry_for(kind, &provisioner, &config);
        let manager = Arc::new(OperationManager::new(
            Arc::clone(&operations),
            registry,
            events.clone(),
            config.operation_timeout,
        ));
        let queue = ProcessingQueue::new(kind.to_string(), manager, config.workers_per_queue);
        operation_queues.insert(kind, queue.handle());
        pools.push(queue);
    }

    let supervisor = Arc::new(OrchestrationSupervisor::new(
        Arc::clone(&orchestrations),
        Arc::clone(&operations),
        resolver,
        operation_queues.clone(),
        events.clone(),
        DEFAULT_POLLING_INTERVAL,
    ));
    let orchestration_queue =
        ProcessingQueue::new("orchestration", supervisor, config.workers_per_queue);
    let orchestration_handle = orchestration_queue.handle();
    pools.push(orchestration_queue);

    // Recovery runs before the listeners open.
    let loader = RecoveryLoader::new(
        Arc::clone(&operations),
        Arc::clone(&orchestrations),
        operation_queues.clone(),
        orchestration_handle.clone(),
        !config.disable_process_operations_in_progress,
    );
    let restored = loader.restore().await?;
    info!(
        operations = restored.operations,
        orchestrations = restored.orchestrations,
        "recovery complete"
    );

    let state = Arc::new(AppState {
        operations,
        orchestrations,
        operation_queues,
        orchestration_queue: orchestration_handle,
        development_mode: config.development_mode,
        default_runtime_version: config.default_runtime_version.clone(),
    });

    let broker_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let status_addr = SocketAddr::from(([0, 0, 0, 0], config.status_port));
    let broker_listener = tokio::net::TcpListener::bind(broker_addr).await?;
    let status_listener = tokio::net::TcpListener::bind(status_addr).await?;
    info!(%broker_addr, %status_addr, "gantry broker listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let broker_server = axum::serve(broker_listener, api::broker_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let status_server = axum::serve(status_listener, api::status_router(metrics))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::try_join!(broker_server, status_server)?;

    for queue in pools {
        queue.shutdown().await;
    }
    info!("gantry broker shut down");
    Ok(())
}
