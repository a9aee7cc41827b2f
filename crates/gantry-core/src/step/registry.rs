//! Ordered step registration for one operation kind.

use std::fmt;
use std::sync::Arc;

use gantry_db::models::Operation;

use super::Step;

/// Predicate deciding whether a registered step is skipped for a given
/// operation (evaluated on every pass; a skipped step records no progress
/// marker).
pub type SkipPredicate = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// A registered step with its ordering weight and optional skip predicate.
#[derive(Clone)]
pub struct StepEntry {
    pub step: Arc<dyn Step>,
    pub weight: u32,
    pub skip: Option<SkipPredicate>,
}

impl StepEntry {
    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Whether this entry is skipped for the operation.
    pub fn skipped(&self, op: &Operation) -> bool {
        self.skip.as_ref().is_some_and(|p| p(op))
    }
}

/// The weight-ordered step list for one operation kind, plus an optional
/// distinguished initialization step that runs before everything else.
///
/// Weight defines a partial order: lower weight runs strictly before
/// higher weight; equal weights run in registration order.
#[derive(Default)]
pub struct StepRegistry {
    init: Option<Arc<dyn Step>>,
    entries: Vec<StepEntry>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initialization step. Treated exactly like any other step
    /// (progress marker, result application), but always runs first.
    pub fn set_init(&mut self, step: impl Step + 'static) -> &mut Self {
        self.set_init_arc(Arc::new(step))
    }

    pub fn set_init_arc(&mut self, step: Arc<dyn Step>) -> &mut Self {
        self.init = Some(step);
        self
    }

    pub fn register(&mut self, weight: u32, step: impl Step + 'static) -> &mut Self {
        self.register_arc(weight, Arc::new(step), None)
    }

    pub fn register_with_skip(
        &mut self,
        weight: u32,
        step: impl Step + 'static,
        skip: SkipPredicate,
    ) -> &mut Self {
        self.register_arc(weight, Arc::new(step), Some(skip))
    }

    pub fn register_arc(
        &mut self,
        weight: u32,
        step: Arc<dyn Step>,
        skip: Option<SkipPredicate>,
    ) -> &mut Self {
        self.entries.push(StepEntry { step, weight, skip });
        self
    }

    /// The execution plan: the init step (if any) followed by the
    /// registered steps sorted by weight. The sort is stable, so equal
    /// weights keep registration order.
    pub fn plan(&self) -> Vec<StepEntry> {
        let mut ordered = self.entries.clone();
        ordered.sort_by_key(|e| e.weight);

        let mut plan = Vec::with_capacity(ordered.len() + 1);
        if let Some(init) = &self.init {
            plan.push(StepEntry {
                step: Arc::clone(init),
                weight: 0,
                skip: None,
            });
        }
        plan.extend(ordered);
        plan
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<(&str, u32)> = self
            .entries
            .iter()
            .map(|e| (e.step.name(), e.weight))
            .collect();
        f.debug_struct("StepRegistry")
            .field("init", &self.init.as_ref().map(|s| s.name()))
            .field("steps", &names)
            .finish()
    }
}
