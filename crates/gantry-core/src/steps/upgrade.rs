//! Upgrade pipeline steps, shared by the runtime- and cluster-upgrade
//! kinds; the payload discriminant picks the control-plane call.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use gantry_db::models::{Operation, OperationPayload};

use crate::provisioner::{RuntimeProvisioner, RuntimeStatus};
use crate::step::{Step, StepResult};

use super::POLL_INTERVAL;

fn upgrade_target(op: &Operation) -> Option<(Uuid, String, bool)> {
    match &op.payload {
        OperationPayload::UpgradeRuntime(p) => {
            Some((p.runtime_id, p.target_version.clone(), false))
        }
        OperationPayload::UpgradeCluster(p) => {
            Some((p.runtime_id, p.target_version.clone(), true))
        }
        _ => None,
    }
}

/// Asks the control plane to start the upgrade.
pub struct TriggerUpgradeStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl TriggerUpgradeStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for TriggerUpgradeStep {
    fn name(&self) -> &str {
        "trigger_upgrade"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some((runtime_id, target_version, cluster)) = upgrade_target(&op) else {
            return StepResult::Fail(op, anyhow!("trigger_upgrade requires an upgrade payload"));
        };

        let result = if cluster {
            self.provisioner
                .upgrade_cluster(runtime_id, &target_version)
                .await
        } else {
            self.provisioner
                .upgrade_runtime(runtime_id, &target_version)
                .await
        };

        match result {
            Ok(()) => {
                op.description = format!("upgrade of runtime {runtime_id} to {target_version} requested");
                StepResult::Done(op)
            }
            Err(error) => {
                warn!(
                    operation_id = %op.id,
                    runtime_id = %runtime_id,
                    error = format!("{error:#}"),
                    "upgrade not accepted, will retry"
                );
                StepResult::Retry(op, POLL_INTERVAL)
            }
        }
    }
}

/// Polls until the upgrade settles.
pub struct CheckUpgradeStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl CheckUpgradeStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for CheckUpgradeStep {
    fn name(&self) -> &str {
        "check_upgrade"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some((runtime_id, target_version, _)) = upgrade_target(&op) else {
            return StepResult::Fail(op, anyhow!("check_upgrade requires an upgrade payload"));
        };

        match self.provisioner.runtime_status(runtime_id).await {
            Ok(RuntimeStatus::Ready) => {
                op.description = format!("runtime {runtime_id} upgraded to {target_version}");
                StepResult::Done(op)
            }
            Ok(RuntimeStatus::Upgrading) => StepResult::Retry(op, POLL_INTERVAL),
            Ok(RuntimeStatus::Failed) => StepResult::Fail(
                op,
                anyhow!("provisioner reported upgrade of runtime {runtime_id} failed"),
            ),
            Ok(status) => StepResult::Fail(
                op,
                anyhow!("unexpected status {status:?} while upgrading runtime {runtime_id}"),
            ),
            Err(_) => StepResult::Retry(op, POLL_INTERVAL),
        }
    }
}
