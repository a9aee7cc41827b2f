//! Parameter-update pipeline step.

use anyhow::anyhow;
use async_trait::async_trait;

use gantry_db::models::Operation;

use crate::step::{Step, StepResult};

/// Validates and records the updated instance parameters. Propagation to
/// the runtime happens on its next reconciliation; the broker only owns
/// the durable record.
pub struct ApplyParametersStep;

#[async_trait]
impl Step for ApplyParametersStep {
    fn name(&self) -> &str {
        "apply_parameters"
    }

    async fn run(&self, mut op: Operation) -> StepResult {
        let Some(payload) = op.payload.as_update() else {
            return StepResult::Fail(op, anyhow!("apply_parameters requires an update payload"));
        };
        if !payload.parameters.is_object() && !payload.parameters.is_null() {
            return StepResult::Fail(op, anyhow!("update parameters must be a JSON object"));
        }
        op.description = "parameters applied".to_string();
        StepResult::Done(op)
    }
}
