//! The shipped step library.
//!
//! Step bodies stay thin: every external effect goes through the
//! [`crate::provisioner::RuntimeProvisioner`] seam, and every step checks
//! the payload before acting so replays after a crash are harmless.

mod deprovision;
mod provision;
mod update;
mod upgrade;

pub use deprovision::{CheckRemovalStep, RemoveRuntimeStep};
pub use provision::{
    CheckRuntimeStep, CreateRuntimeStep, DashboardUrlStep, IssueCredentialsStep,
    ProvisionInitStep,
};
pub use update::ApplyParametersStep;
pub use upgrade::{CheckUpgradeStep, TriggerUpgradeStep};

use std::time::Duration;

/// Cadence for polling a transitional control-plane status.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
