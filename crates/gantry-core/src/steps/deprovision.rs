//! Deprovisioning pipeline steps.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::warn;

use gantry_db::models::Operation;

use crate::provisioner::{RuntimeProvisioner, RuntimeStatus};
use crate::step::{Step, StepResult};

use super::POLL_INTERVAL;

/// Requests runtime deletion. An instance that never reached runtime
/// creation has nothing to remove and completes immediately.
pub struct RemoveRuntimeStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl RemoveRuntimeStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for RemoveRuntimeStep {
    fn name(&self) -> &str {
        "remove_runtime"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(payload) = op.payload.as_deprovision_mut() else {
            return StepResult::Fail(
                op,
                anyhow!("remove_runtime requires a deprovisioning payload"),
            );
        };
        let Some(runtime_id) = payload.runtime_id else {
            op.description = "no runtime to remove".to_string();
            return StepResult::Done(op);
        };

        match self.provisioner.delete_runtime(runtime_id).await {
            Ok(()) => {
                op.description = format!("runtime {runtime_id} removal requested");
                StepResult::Done(op)
            }
            Err(error) => {
                warn!(
                    operation_id = %op.id,
                    error = format!("{error:#}"),
                    "runtime removal not accepted, will retry"
                );
                StepResult::Retry(op, POLL_INTERVAL)
            }
        }
    }
}

/// Polls until the runtime is gone.
pub struct CheckRemovalStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl CheckRemovalStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for CheckRemovalStep {
    fn name(&self) -> &str {
        "check_removal"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(runtime_id) = op.runtime_id() else {
            return StepResult::Done(op);
        };

        match self.provisioner.runtime_status(runtime_id).await {
            Ok(RuntimeStatus::Removed) => {
                op.description = format!("runtime {runtime_id} removed");
                StepResult::Done(op)
            }
            Ok(_) => StepResult::Retry(op, POLL_INTERVAL),
            Err(_) => StepResult::Retry(op, POLL_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::{LocalProvisioner, NewRuntime};
    use gantry_db::models::{DeprovisionPayload, OperationPayload};

    fn deprovision_op(runtime_id: Option<uuid::Uuid>) -> Operation {
        Operation::new(
            "inst-1",
            OperationPayload::Deprovision(DeprovisionPayload {
                plan: "azure".into(),
                runtime_id,
            }),
        )
    }

    #[tokio::test]
    async fn removal_without_runtime_is_a_noop() {
        let provisioner = Arc::new(LocalProvisioner::new(1));
        let step = RemoveRuntimeStep::new(provisioner as Arc<dyn RuntimeProvisioner>);

        let StepResult::Done(op) = step.run(deprovision_op(None)).await else {
            panic!("removal should complete");
        };
        assert!(op.description.contains("no runtime"));
    }

    #[tokio::test]
    async fn removal_then_check_settles() {
        let provisioner = Arc::new(LocalProvisioner::new(1));
        let runtime_id = provisioner
            .create_runtime(&NewRuntime {
                instance_id: "inst-1".into(),
                plan: "azure".into(),
                region: None,
                runtime_version: "2.4.0".into(),
                parameters: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let remove =
            RemoveRuntimeStep::new(Arc::clone(&provisioner) as Arc<dyn RuntimeProvisioner>);
        let check = CheckRemovalStep::new(Arc::clone(&provisioner) as Arc<dyn RuntimeProvisioner>);

        let StepResult::Done(op) = remove.run(deprovision_op(Some(runtime_id))).await else {
            panic!("removal should complete");
        };
        let StepResult::Done(op) = check.run(op).await else {
            panic!("check should complete after settle");
        };
        assert!(op.description.contains("removed"));
    }
}
