//! configmaster kubehub – cluster capability and its kube-rs wiring

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Secret},
};
use kube::{
    api::{Api, GetParams, ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use configmaster_core::{BundleEvent, BundleKind, Connection, WatchEventType};

/// Buffered events per watch before the watch task waits on the consumer.
const WATCH_QUEUE_CAP: usize = 256;
/// Server-side watch timeout. The API server closes the stream after this many
/// seconds, which the controller treats as the end of its run.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A live bundle subscription. `rx` yields `None` once the server closes the stream.
pub struct WatchHandle {
    pub kind: BundleKind,
    pub rx: mpsc::Receiver<Result<BundleEvent>>,
}

/// Everything the controller needs from the orchestration platform, scoped to one namespace.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    fn namespace(&self) -> &str;

    /// Open a watch on bundles of `kind`. Errors only when the subscription cannot be established.
    async fn watch_modifications(&self, kind: BundleKind) -> Result<WatchHandle>;

    async fn list_workloads(&self) -> Result<Vec<Deployment>>;

    /// Fetch a workload as of `expected_version`. `Ok(None)` when it no longer exists.
    async fn get_workload(&self, name: &str, expected_version: &str) -> Result<Option<Deployment>>;

    async fn apply_merge_patch(&self, name: &str, patch: &serde_json::Value) -> Result<()>;
}

/// Build a client for the selected connection target.
pub async fn connect(connection: &Connection) -> Result<Client> {
    let config = match connection {
        Connection::InCluster => kube::Config::incluster().context("loading in-cluster service account config")?,
        Connection::Endpoint(host) => {
            kube::Config::new(host.parse().with_context(|| format!("invalid cluster endpoint {}", host))?)
        }
    };
    Client::try_from(config).context("building kube client")
}

/// [`Cluster`] over the Kubernetes API: ConfigMaps and Secrets are bundles, Deployments are workloads.
#[derive(Clone)]
pub struct KubeCluster {
    namespace: String,
    config_maps: Api<ConfigMap>,
    secrets: Api<Secret>,
    deployments: Api<Deployment>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            config_maps: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client.clone(), namespace),
            deployments: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    fn namespace(&self) -> &str { &self.namespace }

    async fn watch_modifications(&self, kind: BundleKind) -> Result<WatchHandle> {
        let handle = match kind {
            BundleKind::ConfigMap => open_watch(self.config_maps.clone(), kind).await,
            BundleKind::Secret => open_watch(self.secrets.clone(), kind).await,
        }
        .with_context(|| format!("subscribing to {} changes in namespace {}", kind, self.namespace))?;
        info!(kind = %kind, ns = %self.namespace, "watch subscribed");
        Ok(handle)
    }

    async fn list_workloads(&self) -> Result<Vec<Deployment>> {
        let list = self
            .deployments
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing deployments in namespace {}", self.namespace))?;
        Ok(list.items)
    }

    async fn get_workload(&self, name: &str, expected_version: &str) -> Result<Option<Deployment>> {
        match self.deployments.get_with(name, &GetParams::at(expected_version)).await {
            Ok(d) => Ok(Some(d)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e).with_context(|| format!("fetching deployment {} at version {}", name, expected_version)),
        }
    }

    async fn apply_merge_patch(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let pp = PatchParams::default();
        let _ = self
            .deployments
            .patch(name, &pp, &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching deployment {}", name))?;
        Ok(())
    }
}

fn watch_params() -> WatchParams {
    WatchParams::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Subscribe on a dedicated task and forward normalized events into a bounded channel.
/// Returns once the server has accepted (or refused) the subscription.
async fn open_watch<K>(api: Api<K>, kind: BundleKind) -> Result<WatchHandle>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    let (tx, rx) = mpsc::channel::<Result<BundleEvent>>(WATCH_QUEUE_CAP);
    tokio::spawn(async move {
        let stream = match api.watch(&watch_params(), "0").await {
            Ok(s) => {
                let _ = ready_tx.send(Ok(()));
                s
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let ev = match item {
                Ok(ev) => match normalize(ev) {
                    Some(ev) => Ok(ev),
                    None => continue,
                },
                Err(e) => Err(anyhow::Error::from(e).context(format!("{} watch stream error", kind))),
            };
            if tx.send(ev).await.is_err() {
                break;
            }
        }
        debug!(kind = %kind, "watch stream ended");
    });
    ready_rx.await.context("watch task exited before subscribing")??;
    Ok(WatchHandle { kind, rx })
}

/// Map a raw watch event to a [`BundleEvent`]. Bookmarks carry no change and are dropped.
fn normalize<K: Resource>(ev: WatchEvent<K>) -> Option<BundleEvent> {
    let named = |event_type, obj: &K| BundleEvent { event_type, name: obj.meta().name.clone() };
    match ev {
        WatchEvent::Added(o) => Some(named(WatchEventType::Added, &o)),
        WatchEvent::Modified(o) => Some(named(WatchEventType::Modified, &o)),
        WatchEvent::Deleted(o) => Some(named(WatchEventType::Deleted, &o)),
        WatchEvent::Bookmark(_) => None,
        WatchEvent::Error(e) => {
            warn!(code = e.code, reason = %e.reason, message = %e.message, "watch error event");
            Some(BundleEvent { event_type: WatchEventType::Error, name: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn normalize_keeps_type_and_name() {
        let ev = normalize(WatchEvent::Modified(cm("cfg-a"))).expect("event");
        assert_eq!(ev.event_type, WatchEventType::Modified);
        assert_eq!(ev.name.as_deref(), Some("cfg-a"));

        let ev = normalize(WatchEvent::Added(cm("cfg-b"))).expect("event");
        assert_eq!(ev.event_type, WatchEventType::Added);

        let ev = normalize(WatchEvent::Deleted(cm("cfg-c"))).expect("event");
        assert_eq!(ev.event_type, WatchEventType::Deleted);
    }

    #[test]
    fn normalize_error_has_no_name() {
        let err = ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        };
        let ev = normalize::<ConfigMap>(WatchEvent::Error(err)).expect("event");
        assert_eq!(ev.event_type, WatchEventType::Error);
        assert!(ev.name.is_none());
    }

    #[test]
    fn watch_asks_for_an_explicit_server_timeout() {
        let wp = watch_params();
        assert_eq!(wp.timeout, Some(WATCH_TIMEOUT_SECS));
    }
}
