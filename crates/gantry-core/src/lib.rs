//! The broker engine: a durable step pipeline per operation, bounded
//! worker queues, and the orchestration supervisor that fans campaigns out
//! into per-runtime child operations.
//!
//! Everything here is generic over the store traits in `gantry-db`; the
//! hyperscaler-facing side effects live behind [`provisioner::RuntimeProvisioner`]
//! and [`resolver::RuntimeResolver`].

pub mod events;
pub mod manager;
pub mod provisioner;
pub mod queue;
pub mod recovery;
pub mod resolver;
pub mod step;
pub mod steps;
pub mod supervisor;
