//! Rollout patches: stamp the last-update annotation and submit the diff.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use configmaster_core::{merge, WorkloadRef, LAST_UPDATE_ANNOTATION};
use configmaster_debounce::Settle;
use configmaster_kubehub::Cluster;

/// Set the last-update annotation on the deployment and on its pod template.
pub fn stamp(deployment: &mut Deployment, timestamp: &str) {
    deployment
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_UPDATE_ANNOTATION.to_string(), timestamp.to_string());
    if let Some(spec) = deployment.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LAST_UPDATE_ANNOTATION.to_string(), timestamp.to_string());
    }
}

/// Merge patch from the deployment as fetched to the same deployment stamped with `timestamp`.
pub fn rollout_patch(deployment: &Deployment, timestamp: &str) -> Result<Json> {
    let baseline = serde_json::to_value(deployment).context("serializing baseline deployment")?;
    let mut stamped = deployment.clone();
    stamp(&mut stamped, timestamp);
    let target = serde_json::to_value(&stamped).context("serializing stamped deployment")?;
    Ok(merge::two_way(&baseline, &target))
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Patched,
    /// Both annotations already carried this timestamp; nothing was sent.
    Unchanged,
    /// Deployment was gone (or not servable at the observed version) when the countdown fired.
    Gone,
}

/// Settle handler for the update debouncer.
pub struct PatchApplier {
    cluster: Arc<dyn Cluster>,
}

impl PatchApplier {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    pub async fn apply(&self, target: &WorkloadRef) -> Result<Applied> {
        self.apply_at(target, &now_timestamp()).await
    }

    pub async fn apply_at(&self, target: &WorkloadRef, timestamp: &str) -> Result<Applied> {
        let Some(deployment) = self.cluster.get_workload(&target.name, &target.observed_version).await? else {
            return Ok(Applied::Gone);
        };
        let patch = rollout_patch(&deployment, timestamp)
            .with_context(|| format!("building patch for deployment {}", target.name))?;
        if merge::is_empty(&patch) {
            return Ok(Applied::Unchanged);
        }
        self.cluster.apply_merge_patch(&target.name, &patch).await?;
        Ok(Applied::Patched)
    }
}

#[async_trait::async_trait]
impl Settle<WorkloadRef> for PatchApplier {
    async fn settle(&self, target: WorkloadRef) {
        match self.apply(&target).await {
            Ok(Applied::Patched) => {
                counter!("configmaster_patches_applied_total").increment(1);
                info!(deployment = %target.name, version = %target.observed_version, "patched deployment");
            }
            Ok(Applied::Unchanged) => {
                debug!(deployment = %target.name, version = %target.observed_version, "already stamped this second; no patch sent");
            }
            Ok(Applied::Gone) => {
                counter!("configmaster_patch_errors_total").increment(1);
                warn!(deployment = %target.name, version = %target.observed_version, "deployment not found; update dropped");
            }
            Err(e) => {
                counter!("configmaster_patch_errors_total").increment(1);
                error!(deployment = %target.name, version = %target.observed_version, error = ?e, "update abandoned");
            }
        }
    }
}
