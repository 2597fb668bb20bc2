//! Dependency resolution: which deployments consume a settled bundle change.

use std::sync::Arc;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Container, EnvFromSource},
};
use metrics::counter;
use tracing::{debug, error, info, warn};

use configmaster_core::{BundleKind, ChangeDescriptor};
use configmaster_debounce::Settle;
use configmaster_kubehub::Cluster;

use crate::update::UpdateQueue;

/// Where a container pulls in the changed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `envFrom` import of the whole bundle.
    Bundle { container: &'a str },
    /// `env[].valueFrom` reference to one key.
    Key { container: &'a str, var: &'a str, key: &'a str },
}

/// First reference to `change` in `deployment`, if any.
///
/// Containers are visited in order; within a container whole-bundle imports
/// are checked before single-key references. Scanning stops at the first hit.
pub fn first_reference<'a>(deployment: &'a Deployment, change: &ChangeDescriptor) -> Option<Reference<'a>> {
    let containers = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default();
    containers.iter().find_map(|c| container_reference(c, change))
}

fn container_reference<'a>(c: &'a Container, change: &ChangeDescriptor) -> Option<Reference<'a>> {
    let wanted = Some(change.name.as_str());
    if c.env_from.iter().flatten().any(|src| imported_bundle(src, change.kind) == wanted) {
        return Some(Reference::Bundle { container: &c.name });
    }
    c.env.iter().flatten().find_map(|var| {
        let src = var.value_from.as_ref()?;
        let (name, key) = match change.kind {
            BundleKind::ConfigMap => src.config_map_key_ref.as_ref().map(|r| (r.name.as_deref(), r.key.as_str()))?,
            BundleKind::Secret => src.secret_key_ref.as_ref().map(|r| (r.name.as_deref(), r.key.as_str()))?,
        };
        (name == wanted).then_some(Reference::Key { container: &c.name, var: &var.name, key })
    })
}

fn imported_bundle(src: &EnvFromSource, kind: BundleKind) -> Option<&str> {
    match kind {
        BundleKind::ConfigMap => src.config_map_ref.as_ref()?.name.as_deref(),
        BundleKind::Secret => src.secret_ref.as_ref()?.name.as_deref(),
    }
}

/// Settle handler for the change debouncer: scan deployments and queue the dependents.
pub struct DependencyResolver {
    cluster: Arc<dyn Cluster>,
    updates: UpdateQueue,
}

impl DependencyResolver {
    pub fn new(cluster: Arc<dyn Cluster>, updates: UpdateQueue) -> Self {
        Self { cluster, updates }
    }

    /// Queue every dependent deployment once. Returns how many were queued.
    pub async fn resolve(&self, change: &ChangeDescriptor) -> anyhow::Result<usize> {
        let deployments = self.cluster.list_workloads().await?;
        let mut queued = 0usize;
        for deployment in &deployments {
            let Some(reference) = first_reference(deployment, change) else { continue };
            debug!(change = %change, reference = ?reference, "dependency found");
            match self.updates.queue(deployment) {
                Ok(target) => {
                    info!(deployment = %target.name, version = %target.observed_version, change = %change, "queuing update to deployment");
                    queued += 1;
                }
                Err(e) => warn!(change = %change, error = %e, "could not queue dependent deployment"),
            }
        }
        Ok(queued)
    }
}

#[async_trait::async_trait]
impl Settle<ChangeDescriptor> for DependencyResolver {
    async fn settle(&self, change: ChangeDescriptor) {
        counter!("configmaster_changes_settled_total").increment(1);
        info!(change = %change, ns = %self.cluster.namespace(), "change settled; scanning deployments");
        match self.resolve(&change).await {
            Ok(0) => debug!(change = %change, "no dependent deployments"),
            Ok(_) => {}
            Err(e) => {
                counter!("configmaster_list_errors_total").increment(1);
                error!(change = %change, error = ?e, "dependency scan abandoned");
            }
        }
    }
}
