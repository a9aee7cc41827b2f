//! Step registration per operation kind.
//!
//! Weights leave gaps so deployments can splice extra steps (audit-log
//! wiring, hyperscaler-specific resources) between the shipped ones.

use std::sync::Arc;

use gantry_core::provisioner::RuntimeProvisioner;
use gantry_core::step::{SkipForPlan, StepRegistry};
use gantry_core::steps::{
    ApplyParametersStep, CheckRemovalStep, CheckRuntimeStep, CheckUpgradeStep,
    CreateRuntimeStep, DashboardUrlStep, IssueCredentialsStep, ProvisionInitStep,
    RemoveRuntimeStep, TriggerUpgradeStep,
};
use gantry_db::models::OperationKind;

use crate::config::BrokerConfig;

/// Plans without a console; the dashboard step is skipped for them.
const PLANS_WITHOUT_CONSOLE: [&str; 1] = ["trial"];

pub fn registry_for(
    kind: OperationKind,
    provisioner: &Arc<dyn RuntimeProvisioner>,
    config: &BrokerConfig,
) -> StepRegistry {
    let mut registry = StepRegistry::new();
    match kind {
        OperationKind::Provision => {
            registry.set_init(ProvisionInitStep::new(
                config.default_runtime_version.clone(),
            ));
            registry.register(10, CreateRuntimeStep::new(Arc::clone(provisioner)));
            registry.register(20, CheckRuntimeStep::new(Arc::clone(provisioner)));
            registry.register(30, IssueCredentialsStep::new(Arc::clone(provisioner)));
            registry.register(
                100,
                SkipForPlan::new(
                    DashboardUrlStep::new(config.console_url.clone()),
                    PLANS_WITHOUT_CONSOLE.map(str::to_string),
                ),
            );
        }
        OperationKind::Deprovision => {
            registry.register(10, RemoveRuntimeStep::new(Arc::clone(provisioner)));
            registry.register(20, CheckRemovalStep::new(Arc::clone(provisioner)));
        }
        OperationKind::UpgradeRuntime | OperationKind::UpgradeCluster => {
            registry.register(10, TriggerUpgradeStep::new(Arc::clone(provisioner)));
            registry.register(20, CheckUpgradeStep::new(Arc::clone(provisioner)));
        }
        OperationKind::Update => {
            registry.register(10, ApplyParametersStep);
        }
    }
    registry
}
