//! Update queueing: dependent deployments into the update debouncer.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use metrics::counter;

use configmaster_core::{Error, WorkloadRef};
use configmaster_debounce::Debouncer;

/// Key a deployment by name and the resource version it was observed at.
pub fn workload_ref(deployment: &Deployment) -> Result<WorkloadRef, Error> {
    let name = deployment.metadata.name.clone().ok_or(Error::MissingName("Deployment"))?;
    let version = deployment.metadata.resource_version.clone().unwrap_or_default();
    Ok(WorkloadRef::new(name, version))
}

#[derive(Clone)]
pub struct UpdateQueue {
    debouncer: Debouncer<WorkloadRef>,
}

impl UpdateQueue {
    pub fn new(debouncer: Debouncer<WorkloadRef>) -> Self {
        Self { debouncer }
    }

    /// Start or reset the update countdown for this deployment version.
    ///
    /// Each observed version is its own key. If the deployment changes while a
    /// countdown is pending, the older ref still fires on its own schedule and
    /// a later change queues the new version separately.
    pub fn queue(&self, deployment: &Deployment) -> Result<WorkloadRef> {
        let target = workload_ref(deployment)?;
        self.debouncer.notify(target.clone())?;
        counter!("configmaster_updates_queued_total").increment(1);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn ref_uses_name_and_resource_version() {
        let d = Deployment {
            metadata: ObjectMeta { name: Some("web".into()), resource_version: Some("42".into()), ..Default::default() },
            ..Default::default()
        };
        assert_eq!(workload_ref(&d).unwrap(), WorkloadRef::new("web", "42"));
    }

    #[test]
    fn nameless_deployment_is_rejected() {
        let d = Deployment::default();
        assert!(matches!(workload_ref(&d), Err(Error::MissingName("Deployment"))));
    }
}
