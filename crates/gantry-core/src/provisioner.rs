//! The hyperscaler-facing provisioner interface.
//!
//! The shipped step library drives runtime lifecycles exclusively through
//! this trait; concrete hyperscaler integrations implement it out of tree.
//! [`LocalProvisioner`] simulates the control plane in process for the
//! in-memory broker mode and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Lifecycle phase reported by the control plane for one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Provisioning,
    Ready,
    Upgrading,
    Failed,
    Deprovisioning,
    Removed,
}

/// Inputs for a runtime creation request.
#[derive(Debug, Clone)]
pub struct NewRuntime {
    pub instance_id: String,
    pub plan: String,
    pub region: Option<String>,
    pub runtime_version: String,
    pub parameters: serde_json::Value,
}

/// Control-plane operations the step library needs. All calls must be
/// idempotent: steps re-invoke them after crashes.
#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    /// Request creation; returns the assigned runtime ID.
    async fn create_runtime(&self, runtime: &NewRuntime) -> Result<Uuid>;

    async fn runtime_status(&self, runtime_id: Uuid) -> Result<RuntimeStatus>;

    /// Admin kubeconfig for a ready runtime.
    async fn admin_kubeconfig(&self, runtime_id: Uuid) -> Result<String>;

    async fn delete_runtime(&self, runtime_id: Uuid) -> Result<()>;

    async fn upgrade_runtime(&self, runtime_id: Uuid, target_version: &str) -> Result<()>;

    async fn upgrade_cluster(&self, runtime_id: Uuid, kubernetes_version: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LocalProvisioner
// ---------------------------------------------------------------------------

struct LocalRuntime {
    status: RuntimeStatus,
    polls: u32,
}

/// In-process control-plane simulation.
///
/// Transitional statuses (provisioning, upgrading, deprovisioning) settle
/// after `settle_after` status polls, which makes step retry behavior
/// deterministic in tests.
pub struct LocalProvisioner {
    settle_after: u32,
    runtimes: Mutex<HashMap<Uuid, LocalRuntime>>,
}

impl LocalProvisioner {
    pub fn new(settle_after: u32) -> Self {
        Self {
            settle_after,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of runtimes currently tracked (removed ones excluded).
    pub fn runtime_count(&self) -> usize {
        self.runtimes
            .lock()
            .expect("local provisioner poisoned")
            .values()
            .filter(|r| r.status != RuntimeStatus::Removed)
            .count()
    }
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl RuntimeProvisioner for LocalProvisioner {
    async fn create_runtime(&self, _runtime: &NewRuntime) -> Result<Uuid> {
        let runtime_id = Uuid::new_v4();
        let mut guard = self.runtimes.lock().expect("local provisioner poisoned");
        guard.insert(
            runtime_id,
            LocalRuntime {
                status: RuntimeStatus::Provisioning,
                polls: 0,
            },
        );
        Ok(runtime_id)
    }

    async fn runtime_status(&self, runtime_id: Uuid) -> Result<RuntimeStatus> {
        let mut guard = self.runtimes.lock().expect("local provisioner poisoned");
        let Some(runtime) = guard.get_mut(&runtime_id) else {
            // Unknown runtimes read as removed, which keeps deletion
            // checks idempotent.
            return Ok(RuntimeStatus::Removed);
        };

        match runtime.status {
            RuntimeStatus::Provisioning | RuntimeStatus::Upgrading => {
                runtime.polls += 1;
                if runtime.polls >= self.settle_after {
                    runtime.status = RuntimeStatus::Ready;
                    runtime.polls = 0;
                }
            }
            RuntimeStatus::Deprovisioning => {
                runtime.polls += 1;
                if runtime.polls >= self.settle_after {
                    runtime.status = RuntimeStatus::Removed;
                    runtime.polls = 0;
                }
            }
            _ => {}
        }

        Ok(runtime.status)
    }

    async fn admin_kubeconfig(&self, runtime_id: Uuid) -> Result<String> {
        Ok(format!(
            "apiVersion: v1\nkind: Config\ncurrent-context: runtime-{runtime_id}\n"
        ))
    }

    async fn delete_runtime(&self, runtime_id: Uuid) -> Result<()> {
        let mut guard = self.runtimes.lock().expect("local provisioner poisoned");
        if let Some(runtime) = guard.get_mut(&runtime_id) {
            if runtime.status != RuntimeStatus::Removed {
                runtime.status = RuntimeStatus::Deprovisioning;
                runtime.polls = 0;
            }
        }
        Ok(())
    }

    async fn upgrade_runtime(&self, runtime_id: Uuid, _target_version: &str) -> Result<()> {
        let mut guard = self.runtimes.lock().expect("local provisioner poisoned");
        let runtime = guard
            .entry(runtime_id)
            .or_insert_with(|| LocalRuntime {
                status: RuntimeStatus::Ready,
                polls: 0,
            });
        runtime.status = RuntimeStatus::Upgrading;
        runtime.polls = 0;
        Ok(())
    }

    async fn upgrade_cluster(&self, runtime_id: Uuid, kubernetes_version: &str) -> Result<()> {
        self.upgrade_runtime(runtime_id, kubernetes_version).await
    }
}
