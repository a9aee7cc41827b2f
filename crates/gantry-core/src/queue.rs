//! Bounded worker pools dispatching record IDs to an executor.
//!
//! One queue exists per operation kind (plus one for orchestrations) so
//! provisioning, deprovisioning, and upgrade traffic cannot starve each
//! other. Inside a queue, workers are independent; deduplication only
//! guards IDs that are enqueued and not yet picked up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the executor wants the queue to do next with an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Nothing further; the record reached a resting point.
    Done,
    /// Re-enqueue the ID after at least the given delay. The worker is
    /// released immediately; the delay runs on a detached timer.
    Requeue(Duration),
}

/// Anything a queue can drive: the operation manager and the orchestration
/// supervisor both implement this.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome>;
}

struct QueueShared {
    name: String,
    tx: mpsc::UnboundedSender<Uuid>,
    /// IDs currently enqueued (not yet dequeued by a worker).
    enqueued: StdMutex<HashSet<Uuid>>,
    accepting: AtomicBool,
    cancel: CancellationToken,
}

impl QueueShared {
    fn add(&self, id: Uuid) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        let mut enqueued = self.enqueued.lock().expect("queue dedup set poisoned");
        if !enqueued.insert(id) {
            // Already enqueued; adding again is a no-op.
            return false;
        }
        if self.tx.send(id).is_err() {
            enqueued.remove(&id);
            return false;
        }
        true
    }
}

/// Cheap cloneable handle for producers (the boundary, the supervisor, the
/// recovery loader, delayed-requeue timers).
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Non-blocking, deduplicating append. Returns whether the ID was
    /// actually enqueued.
    pub fn add(&self, id: Uuid) -> bool {
        self.shared.add(id)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// A FIFO of record IDs consumed by a fixed pool of workers.
pub struct ProcessingQueue {
    shared: Arc<QueueShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessingQueue {
    /// Spawn the worker pool. `workers` is clamped to at least 1.
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            name: name.into(),
            tx,
            enqueued: StdMutex::new(HashSet::new()),
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                let executor = Arc::clone(&executor);
                tokio::spawn(worker_loop(shared, rx, executor, worker))
            })
            .collect();

        Self { shared, workers }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`QueueHandle::add`].
    pub fn add(&self, id: Uuid) -> bool {
        self.shared.add(id)
    }

    /// Reject new IDs, let workers finish their current record, and join
    /// the pool. Queued-but-unstarted IDs are dropped; the recovery loader
    /// picks them up on the next start.
    pub async fn shutdown(mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(queue = %self.shared.name, "queue shut down");
    }
}

async fn worker_loop(
    shared: Arc<QueueShared>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    executor: Arc<dyn Executor>,
    worker: usize,
) {
    loop {
        let id = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            id = async { rx.lock().await.recv().await } => match id {
                Some(id) => id,
                None => return,
            },
        };

        shared
            .enqueued
            .lock()
            .expect("queue dedup set poisoned")
            .remove(&id);

        match executor.execute(id).await {
            Ok(ExecuteOutcome::Done) => {}
            Ok(ExecuteOutcome::Requeue(delay)) => {
                // The worker returns to the pool; the re-add waits on its
                // own timer. Scheduling is best-effort: "after at least".
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            shared.add(id);
                        }
                    }
                });
            }
            Err(error) => {
                // The record stays in the store; a future enqueue or the
                // recovery loader will retry it.
                tracing::warn!(
                    queue = %shared.name,
                    worker,
                    record_id = %id,
                    error = format!("{error:#}"),
                    "processing failed, dropping id"
                );
            }
        }
    }
}
