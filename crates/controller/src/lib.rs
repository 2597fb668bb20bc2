//! configmaster controller: turns bundle modifications into debounced rollout patches.
//!
//! watch streams → change debouncer → dependency scan → update debouncer → patch

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::{JoinHandle, JoinSet};
use tracing::info;

use configmaster_core::{BundleKind, ChangeDescriptor, WorkloadRef};
use configmaster_debounce::Debouncer;
use configmaster_kubehub::Cluster;

pub mod patch;
pub mod resolve;
pub mod update;
pub mod watch;

pub use patch::PatchApplier;
pub use resolve::DependencyResolver;
pub use update::UpdateQueue;

/// The two debounce stages wired together. Feed it through [`Controller::changes`].
pub struct Controller {
    changes: Debouncer<ChangeDescriptor>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    pub fn start(cluster: Arc<dyn Cluster>, delay: Duration) -> Self {
        let applier = Arc::new(PatchApplier::new(Arc::clone(&cluster)));
        let (updates, update_task) = Debouncer::<WorkloadRef>::spawn("update", delay, applier);
        let resolver = Arc::new(DependencyResolver::new(cluster, UpdateQueue::new(updates)));
        let (changes, change_task) = Debouncer::<ChangeDescriptor>::spawn("change", delay, resolver);
        Self { changes, tasks: vec![change_task, update_task] }
    }

    pub fn changes(&self) -> &Debouncer<ChangeDescriptor> { &self.changes }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Subscribe to both bundle kinds, then run until a watch ends or fails.
///
/// Both subscriptions are opened before anything else starts; if either
/// cannot be established the error is returned immediately.
///
/// Watches are not re-established. The API server closes each stream after
/// its watch timeout (about five minutes), so a long-lived deployment of this
/// binary exits with an error at that point and relies on its supervisor to
/// restart it. Under Kubernetes that restart is subject to CrashLoopBackOff,
/// and changes made while the process is down are not seen.
pub async fn run(cluster: Arc<dyn Cluster>, delay: Duration) -> Result<()> {
    let mut watches = Vec::with_capacity(BundleKind::ALL.len());
    for kind in BundleKind::ALL {
        watches.push(cluster.watch_modifications(kind).await?);
    }

    let controller = Controller::start(Arc::clone(&cluster), delay);
    let mut set = JoinSet::new();
    for w in watches {
        set.spawn(watch::forward_modifications(w, controller.changes().clone()));
    }
    info!(ns = %cluster.namespace(), delay_secs = delay.as_secs(), "controller running");

    match set.join_next().await {
        Some(Ok(res)) => res,
        Some(Err(e)) => Err(anyhow!("watch task failed: {}", e)),
        None => Ok(()),
    }
}
