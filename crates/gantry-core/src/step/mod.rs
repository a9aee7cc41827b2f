//! The `Step` trait -- the unit of work inside an operation.
//!
//! Each step is an idempotent, restartable slice of a lifecycle pipeline.
//! The trait is object-safe so steps can be stored as `Arc<dyn Step>` in
//! the [`registry::StepRegistry`].

mod registry;
mod wrappers;

pub use registry::{SkipPredicate, StepEntry, StepRegistry};
pub use wrappers::{EnableForPlan, SkipForPlan};

use std::time::Duration;

use async_trait::async_trait;

use gantry_db::models::Operation;

/// Outcome of one step invocation.
///
/// Every variant carries the operation back so the manager can persist
/// whatever sub-state the step accumulated in the payload, including on
/// permanent failure.
#[derive(Debug)]
pub enum StepResult {
    /// The step has completed. The manager records the step's name in the
    /// progress map and advances to the next step.
    Done(Operation),
    /// Not done yet. The manager persists the operation, releases the
    /// worker, and reschedules the operation after at least the given
    /// delay. A step may return this any number of times; endurance is
    /// bounded only by the operation timeout.
    Retry(Operation, Duration),
    /// Permanent failure. The manager persists the operation, marks it
    /// failed with the error's message as the description, and stops.
    Fail(Operation, anyhow::Error),
}

/// A single unit of work inside an operation pipeline.
///
/// # Contract
///
/// - Check the operation's payload before performing an external side
///   effect, and tolerate re-invocation after a crash between the side
///   effect and the persistence of its result.
/// - Never mutate the operation's `state` field; that belongs to the
///   manager.
/// - Signal transient trouble as [`StepResult::Retry`], not as a failure.
/// - Do not panic; a panic is recovered by the manager and converted into
///   a permanent failure.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name; keys the operation's progress map.
    fn name(&self) -> &str;

    async fn run(&self, op: Operation) -> StepResult;
}

// If this compiles, the trait can be used as `dyn Step`.
const _: () = {
    fn _assert_object_safe(_: &dyn Step) {}
};
