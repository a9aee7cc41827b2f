//! Provisioning pipeline steps.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::warn;

use gantry_db::models::{Operation, RuntimeCredentials};

use crate::provisioner::{NewRuntime, RuntimeProvisioner, RuntimeStatus};
use crate::step::{Step, StepResult};

use super::POLL_INTERVAL;

/// The distinguished pre-step of the provisioning pipeline: stamps the
/// broker's default runtime version when the request did not pin one.
pub struct ProvisionInitStep {
    default_version: String,
}

impl ProvisionInitStep {
    pub fn new(default_version: impl Into<String>) -> Self {
        Self {
            default_version: default_version.into(),
        }
    }
}

#[async_trait]
impl Step for ProvisionInitStep {
    fn name(&self) -> &str {
        "initialization"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(payload) = op.payload.as_provision_mut() else {
            return StepResult::Fail(op, anyhow!("initialization requires a provisioning payload"));
        };
        if payload.runtime_version.is_none() {
            payload.runtime_version = Some(self.default_version.clone());
        }
        StepResult::Done(op)
    }
}

/// Requests runtime creation from the provisioner and records the assigned
/// runtime ID in the payload.
pub struct CreateRuntimeStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl CreateRuntimeStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for CreateRuntimeStep {
    fn name(&self) -> &str {
        "create_runtime"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(payload) = op.payload.as_provision().cloned() else {
            return StepResult::Fail(op, anyhow!("create_runtime requires a provisioning payload"));
        };
        if payload.runtime_id.is_some() {
            // Replay after a crash between the create call and persistence.
            return StepResult::Done(op);
        }
        let Some(runtime_version) = payload.runtime_version else {
            return StepResult::Fail(op, anyhow!("runtime version not resolved before create"));
        };

        let request = NewRuntime {
            instance_id: op.instance_id.clone(),
            plan: payload.plan,
            region: payload.region,
            runtime_version,
            parameters: payload.parameters,
        };

        match self.provisioner.create_runtime(&request).await {
            Ok(runtime_id) => {
                if let Some(p) = op.payload.as_provision_mut() {
                    p.runtime_id = Some(runtime_id);
                }
                op.description = format!("runtime {runtime_id} creation requested");
                StepResult::Done(op)
            }
            Err(error) => {
                // Control-plane refusals here are transient; the operation
                // timeout bounds how long we keep trying.
                warn!(
                    operation_id = %op.id,
                    error = format!("{error:#}"),
                    "runtime creation not accepted, will retry"
                );
                StepResult::Retry(op, POLL_INTERVAL)
            }
        }
    }
}

/// Polls the provisioner until the runtime reports ready.
pub struct CheckRuntimeStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl CheckRuntimeStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for CheckRuntimeStep {
    fn name(&self) -> &str {
        "check_runtime"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(runtime_id) = op.payload.as_provision().and_then(|p| p.runtime_id) else {
            return StepResult::Fail(op, anyhow!("runtime was never created"));
        };

        match self.provisioner.runtime_status(runtime_id).await {
            Ok(RuntimeStatus::Ready) => {
                op.description = format!("runtime {runtime_id} is ready");
                StepResult::Done(op)
            }
            Ok(RuntimeStatus::Provisioning) => {
                op.description = format!("runtime {runtime_id} is provisioning");
                StepResult::Retry(op, POLL_INTERVAL)
            }
            Ok(RuntimeStatus::Failed) => {
                StepResult::Fail(op, anyhow!("provisioner reported runtime {runtime_id} failed"))
            }
            Ok(status) => StepResult::Fail(
                op,
                anyhow!("unexpected status {status:?} for runtime {runtime_id}"),
            ),
            Err(_) => StepResult::Retry(op, POLL_INTERVAL),
        }
    }
}

/// Fetches the admin kubeconfig for the ready runtime.
pub struct IssueCredentialsStep {
    provisioner: Arc<dyn RuntimeProvisioner>,
}

impl IssueCredentialsStep {
    pub fn new(provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for IssueCredentialsStep {
    fn name(&self) -> &str {
        "issue_credentials"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(payload) = op.payload.as_provision().cloned() else {
            return StepResult::Fail(
                op,
                anyhow!("issue_credentials requires a provisioning payload"),
            );
        };
        if payload.credentials.is_some() {
            return StepResult::Done(op);
        }
        let Some(runtime_id) = payload.runtime_id else {
            return StepResult::Fail(op, anyhow!("runtime was never created"));
        };

        match self.provisioner.admin_kubeconfig(runtime_id).await {
            Ok(kubeconfig) => {
                if let Some(p) = op.payload.as_provision_mut() {
                    p.credentials = Some(RuntimeCredentials { kubeconfig });
                }
                op.description = "credentials issued".to_string();
                StepResult::Done(op)
            }
            Err(_) => StepResult::Retry(op, POLL_INTERVAL),
        }
    }
}

/// Derives the console URL for the instance. Registered under a
/// [`crate::step::SkipForPlan`] wrapper for plans without a console.
pub struct DashboardUrlStep {
    console_base: String,
}

impl DashboardUrlStep {
    pub fn new(console_base: impl Into<String>) -> Self {
        Self {
            console_base: console_base.into(),
        }
    }
}

#[async_trait]
impl Step for DashboardUrlStep {
    fn name(&self) -> &str {
        "set_dashboard_url"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let url = format!("{}/instances/{}", self.console_base, op.instance_id);
        let Some(payload) = op.payload.as_provision_mut() else {
            return StepResult::Fail(
                op,
                anyhow!("set_dashboard_url requires a provisioning payload"),
            );
        };
        payload.dashboard_url = Some(url);
        StepResult::Done(op)
    }
}
