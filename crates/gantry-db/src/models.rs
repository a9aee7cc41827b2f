use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// State of a single operation.
///
/// Transitions are a monotone walk `pending -> in_progress -> terminal`;
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationState {
    /// Terminal states never change again and carry a `finished_at` stamp.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationState {
    type Err = OperationStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(OperationStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OperationState`] string.
#[derive(Debug, Clone)]
pub struct OperationStateParseError(pub String);

impl fmt::Display for OperationStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation state: {:?}", self.0)
    }
}

impl std::error::Error for OperationStateParseError {}

// ---------------------------------------------------------------------------

/// Kind of lifecycle operation. Derived from the payload discriminant; the
/// two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Deprovision,
    UpgradeRuntime,
    UpgradeCluster,
    Update,
}

impl OperationKind {
    /// All kinds, in queue-creation order.
    pub const ALL: [OperationKind; 5] = [
        Self::Provision,
        Self::Deprovision,
        Self::UpgradeRuntime,
        Self::UpgradeCluster,
        Self::Update,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::UpgradeRuntime => "upgrade_runtime",
            Self::UpgradeCluster => "upgrade_cluster",
            Self::Update => "update",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationKind {
    type Err = OperationKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "upgrade_runtime" => Ok(Self::UpgradeRuntime),
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            "update" => Ok(Self::Update),
            other => Err(OperationKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OperationKind`] string.
#[derive(Debug, Clone)]
pub struct OperationKindParseError(pub String);

impl fmt::Display for OperationKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation kind: {:?}", self.0)
    }
}

impl std::error::Error for OperationKindParseError {}

// ---------------------------------------------------------------------------

/// State of an orchestration (a fleet-wide campaign).
///
/// `canceling` is transient: it resolves to `canceled` once no child is
/// still in progress. The terminal state is derived from child states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Pending,
    InProgress,
    Canceling,
    Canceled,
    Succeeded,
    Failed,
    Retrying,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestrationState {
    type Err = OrchestrationStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(OrchestrationStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrchestrationState`] string.
#[derive(Debug, Clone)]
pub struct OrchestrationStateParseError(pub String);

impl fmt::Display for OrchestrationStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid orchestration state: {:?}", self.0)
    }
}

impl std::error::Error for OrchestrationStateParseError {}

// ---------------------------------------------------------------------------

/// Kind of orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationKind {
    UpgradeRuntime,
    UpgradeCluster,
}

impl OrchestrationKind {
    /// The operation kind of the children this orchestration produces.
    pub fn child_kind(&self) -> OperationKind {
        match self {
            Self::UpgradeRuntime => OperationKind::UpgradeRuntime,
            Self::UpgradeCluster => OperationKind::UpgradeCluster,
        }
    }
}

impl fmt::Display for OrchestrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UpgradeRuntime => "upgrade_runtime",
            Self::UpgradeCluster => "upgrade_cluster",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestrationKind {
    type Err = OrchestrationKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upgrade_runtime" => Ok(Self::UpgradeRuntime),
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            other => Err(OrchestrationKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrchestrationKind`] string.
#[derive(Debug, Clone)]
pub struct OrchestrationKindParseError(pub String);

impl fmt::Display for OrchestrationKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid orchestration kind: {:?}", self.0)
    }
}

impl std::error::Error for OrchestrationKindParseError {}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// Credentials issued for a provisioned runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCredentials {
    pub kubeconfig: String,
}

/// Kind-specific operation sub-state, owned by the steps of that kind.
///
/// Serialized as tagged JSON (the tag doubles as the operation kind) and
/// stored in the `payload` JSONB column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Provision(ProvisionPayload),
    Deprovision(DeprovisionPayload),
    UpgradeRuntime(UpgradeRuntimePayload),
    UpgradeCluster(UpgradeClusterPayload),
    Update(UpdatePayload),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Provision(_) => OperationKind::Provision,
            Self::Deprovision(_) => OperationKind::Deprovision,
            Self::UpgradeRuntime(_) => OperationKind::UpgradeRuntime,
            Self::UpgradeCluster(_) => OperationKind::UpgradeCluster,
            Self::Update(_) => OperationKind::Update,
        }
    }

    pub fn as_provision_mut(&mut self) -> Option<&mut ProvisionPayload> {
        match self {
            Self::Provision(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_provision(&self) -> Option<&ProvisionPayload> {
        match self {
            Self::Provision(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_deprovision_mut(&mut self) -> Option<&mut DeprovisionPayload> {
        match self {
            Self::Deprovision(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_upgrade_runtime(&self) -> Option<&UpgradeRuntimePayload> {
        match self {
            Self::UpgradeRuntime(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_upgrade_cluster(&self) -> Option<&UpgradeClusterPayload> {
        match self {
            Self::UpgradeCluster(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_update(&self) -> Option<&UpdatePayload> {
        match self {
            Self::Update(p) => Some(p),
            _ => None,
        }
    }
}

/// Sub-state of a provisioning operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionPayload {
    /// Service plan the instance was ordered under (e.g. "azure", "trial").
    pub plan: String,
    pub region: Option<String>,
    /// Raw provisioning parameters from the catalog request.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Runtime version to install; stamped by the initialization step when
    /// the request did not pin one.
    pub runtime_version: Option<String>,
    /// Identifier assigned by the provisioner once the runtime is created.
    pub runtime_id: Option<Uuid>,
    pub dashboard_url: Option<String>,
    pub credentials: Option<RuntimeCredentials>,
}

impl ProvisionPayload {
    pub fn new(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            region: None,
            parameters: serde_json::Value::Null,
            runtime_version: None,
            runtime_id: None,
            dashboard_url: None,
            credentials: None,
        }
    }
}

/// Sub-state of a deprovisioning operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprovisionPayload {
    pub plan: String,
    /// Absent when the instance never got as far as runtime creation.
    pub runtime_id: Option<Uuid>,
}

/// Sub-state of a runtime-upgrade operation (child of a campaign).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRuntimePayload {
    pub runtime_id: Uuid,
    pub target_version: String,
    pub previous_version: Option<String>,
}

/// Sub-state of a cluster (Kubernetes) upgrade operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeClusterPayload {
    pub runtime_id: Uuid,
    pub target_version: String,
}

/// Sub-state of a parameter-update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub plan: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A single durable lifecycle action on one instance.
///
/// Mutated exclusively by the operation manager under optimistic
/// concurrency (the `version` counter); never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    /// The service instance this operation acts on.
    pub instance_id: String,
    /// Owning campaign, for children created by the supervisor.
    pub orchestration_id: Option<Uuid>,
    pub state: OperationState,
    /// Human-readable last step or failure reason.
    pub description: String,
    /// Step name -> completion time. A marker, once set, is never cleared.
    pub progress: BTreeMap<String, DateTime<Utc>>,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the state is terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every store update.
    pub version: i32,
}

impl Operation {
    /// Build a fresh pending operation with a random ID.
    pub fn new(instance_id: impl Into<String>, payload: OperationPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            orchestration_id: None,
            state: OperationState::Pending,
            description: String::new(),
            progress: BTreeMap::new(),
            payload,
            created_at: now,
            updated_at: now,
            finished_at: None,
            version: 0,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// The service plan, for kinds that carry one.
    pub fn plan(&self) -> Option<&str> {
        match &self.payload {
            OperationPayload::Provision(p) => Some(&p.plan),
            OperationPayload::Deprovision(p) => Some(&p.plan),
            OperationPayload::Update(p) => Some(&p.plan),
            OperationPayload::UpgradeRuntime(_) | OperationPayload::UpgradeCluster(_) => None,
        }
    }

    /// The runtime this operation targets, once known.
    pub fn runtime_id(&self) -> Option<Uuid> {
        match &self.payload {
            OperationPayload::Provision(p) => p.runtime_id,
            OperationPayload::Deprovision(p) => p.runtime_id,
            OperationPayload::UpgradeRuntime(p) => Some(p.runtime_id),
            OperationPayload::UpgradeCluster(p) => Some(p.runtime_id),
            OperationPayload::Update(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Which runtimes a campaign targets. Criteria are a union: a runtime is
/// selected when any of them matches (or `include_all` is set).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default)]
    pub runtime_ids: Vec<Uuid>,
    /// Label equality; a runtime matches when it carries every listed pair.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub regions: Vec<String>,
    /// Glob patterns over cluster names, e.g. `prod-eu-*`.
    #[serde(default)]
    pub cluster_globs: Vec<String>,
    #[serde(default)]
    pub include_all: bool,
}

/// Days-of-week plus a time-of-day range gating when the supervisor may
/// release new children. Overnight ranges (`start > end`) wrap midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    /// Empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    /// Whether the given instant falls inside the window (evaluated in UTC).
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let t = at.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Overnight window, e.g. 22:00-04:00.
            t >= self.start || t < self.end
        }
    }
}

/// Execution parameters of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationParameters {
    pub targets: TargetSelector,
    /// Maximum number of children in progress at once.
    pub parallelism: u32,
    pub schedule: Option<ScheduleWindow>,
    /// Version the children upgrade to (runtime version or Kubernetes
    /// version, depending on the orchestration kind).
    pub target_version: String,
}

/// Aggregate child-operation counts, refreshed by the supervisor on every
/// scan. Counters equal the exact counts of children in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildCounters {
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub canceled: u32,
}

impl ChildCounters {
    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.succeeded + self.failed + self.canceled
    }

    /// Count one child into the matching bucket.
    pub fn record(&mut self, state: OperationState) {
        match state {
            OperationState::Pending => self.pending += 1,
            OperationState::InProgress => self.in_progress += 1,
            OperationState::Succeeded => self.succeeded += 1,
            OperationState::Failed => self.failed += 1,
            OperationState::Canceled => self.canceled += 1,
        }
    }
}

/// A fleet-wide campaign producing one child operation per targeted
/// runtime. Mutated by the supervisor and the cancellation surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: Uuid,
    pub kind: OrchestrationKind,
    pub state: OrchestrationState,
    pub description: String,
    pub parameters: OrchestrationParameters,
    pub counters: ChildCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl Orchestration {
    pub fn new(kind: OrchestrationKind, parameters: OrchestrationParameters) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            state: OrchestrationState::Pending,
            description: String::new(),
            parameters,
            counters: ChildCounters::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filter for operation listings. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub kinds: Vec<OperationKind>,
    pub states: Vec<OperationState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number; `None` disables pagination.
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl OperationFilter {
    pub fn states(states: impl Into<Vec<OperationState>>) -> Self {
        Self {
            states: states.into(),
            ..Self::default()
        }
    }

    /// Whether the operation passes the non-pagination criteria.
    pub fn matches(&self, op: &Operation) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&op.kind()) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&op.state) {
            return false;
        }
        if let Some(after) = self.created_after {
            if op.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if op.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Filter for orchestration listings. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationFilter {
    pub kinds: Vec<OrchestrationKind>,
    pub states: Vec<OrchestrationState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl OrchestrationFilter {
    pub fn states(states: impl Into<Vec<OrchestrationState>>) -> Self {
        Self {
            states: states.into(),
            ..Self::default()
        }
    }

    pub fn matches(&self, orch: &Orchestration) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&orch.kind) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&orch.state) {
            return false;
        }
        if let Some(after) = self.created_after {
            if orch.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if orch.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Apply 1-based pagination to an already-filtered, already-sorted list.
pub(crate) fn paginate<T>(items: Vec<T>, page: Option<u32>, page_size: Option<u32>) -> Vec<T> {
    match (page, page_size) {
        (Some(page), Some(size)) if size > 0 => {
            let start = (page.saturating_sub(1) as usize) * size as usize;
            items
                .into_iter()
                .skip(start)
                .take(size as usize)
                .collect()
        }
        (None, Some(size)) => items.into_iter().take(size as usize).collect(),
        _ => items,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
