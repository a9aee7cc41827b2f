//! Plan-conditional wrappers composing over raw steps.
//!
//! Both implement [`Step`] and delegate to an inner step, so they can be
//! registered anywhere a raw step can. An operation whose kind carries no
//! plan (campaign children) is never filtered.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use gantry_db::models::Operation;

use super::{Step, StepResult};

/// Runs the inner step unless the operation's plan is in the skip set; for
/// skipped plans the step reports completion immediately without touching
/// the operation.
pub struct SkipForPlan {
    inner: Arc<dyn Step>,
    plans: HashSet<String>,
}

impl SkipForPlan {
    pub fn new(inner: impl Step + 'static, plans: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(inner),
            plans: plans.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Step for SkipForPlan {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, op: Operation) -> StepResult {
        match op.plan() {
            Some(plan) if self.plans.contains(plan) => StepResult::Done(op),
            _ => self.inner.run(op).await,
        }
    }
}

/// The inverse of [`SkipForPlan`]: runs the inner step only for plans in
/// the enable set.
pub struct EnableForPlan {
    inner: Arc<dyn Step>,
    plans: HashSet<String>,
}

impl EnableForPlan {
    pub fn new(inner: impl Step + 'static, plans: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(inner),
            plans: plans.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Step for EnableForPlan {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, op: Operation) -> StepResult {
        match op.plan() {
            Some(plan) if self.plans.contains(plan) => self.inner.run(op).await,
            _ => StepResult::Done(op),
        }
    }
}
