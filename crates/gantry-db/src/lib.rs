//! Durable storage for broker operations and orchestrations.
//!
//! The engine in `gantry-core` talks to storage exclusively through the
//! [`store::OperationStore`] and [`store::OrchestrationStore`] traits. Two
//! implementations ship here: [`postgres`] (sqlx, the production backend)
//! and [`memory`] (process-local, used by the in-memory broker mode and the
//! default test suite).

pub mod config;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;
