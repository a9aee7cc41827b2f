//! Target resolution for upgrade campaigns.
//!
//! The resolver turns a campaign's [`TargetSelector`] into a concrete
//! runtime list. Production deployments back this with the runtime catalog
//! service; [`StaticRuntimeResolver`] serves the in-memory broker mode and
//! tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gantry_db::models::TargetSelector;

/// A managed runtime as known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRef {
    pub runtime_id: Uuid,
    pub instance_id: String,
    pub cluster_name: String,
    pub region: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Resolves a selector to the runtimes it targets.
///
/// Pure over its inputs; may block on external catalog calls. The result
/// is sorted by runtime ID so repeated resolution is stable.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn resolve(&self, selector: &TargetSelector) -> Result<Vec<RuntimeRef>>;
}

/// In-memory resolver over a registered runtime list.
#[derive(Default)]
pub struct StaticRuntimeResolver {
    runtimes: RwLock<Vec<RuntimeRef>>,
}

impl StaticRuntimeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtimes(runtimes: Vec<RuntimeRef>) -> Self {
        Self {
            runtimes: RwLock::new(runtimes),
        }
    }

    pub fn register(&self, runtime: RuntimeRef) {
        self.runtimes
            .write()
            .expect("runtime catalog poisoned")
            .push(runtime);
    }
}

/// Selector criteria are a union: any single match selects the runtime.
fn selected(selector: &TargetSelector, runtime: &RuntimeRef) -> bool {
    if selector.include_all {
        return true;
    }
    if selector.runtime_ids.contains(&runtime.runtime_id) {
        return true;
    }
    if selector.regions.iter().any(|r| r == &runtime.region) {
        return true;
    }
    if selector.cluster_globs.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(&runtime.cluster_name))
            .unwrap_or(false)
    }) {
        return true;
    }
    if !selector.labels.is_empty()
        && selector
            .labels
            .iter()
            .all(|(k, v)| runtime.labels.get(k) == Some(v))
    {
        return true;
    }
    false
}

#[async_trait]
impl RuntimeResolver for StaticRuntimeResolver {
    async fn resolve(&self, selector: &TargetSelector) -> Result<Vec<RuntimeRef>> {
        let guard = self.runtimes.read().expect("runtime catalog poisoned");
        let mut matching: Vec<RuntimeRef> = guard
            .iter()
            .filter(|r| selected(selector, r))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.runtime_id);
        Ok(matching)
    }
}
