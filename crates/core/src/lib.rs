//! configmaster core types: change descriptors, workload refs, settings and errors

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod merge;

/// Annotation stamped on a workload (and its pod template) to trigger a rollout.
pub const LAST_UPDATE_ANNOTATION: &str = "configmaster/last.update";

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_DELAY_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("must export CONFIGMASTER_HOST when not running in-cluster")]
    MissingHost,
    #[error("invalid delay {0:?}: expected whole seconds")]
    InvalidDelay(String),
    #[error("{0} object has no metadata.name")]
    MissingName(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The two classes of configuration bundle a workload can consume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BundleKind {
    ConfigMap,
    Secret,
}

impl BundleKind {
    pub const ALL: [BundleKind; 2] = [BundleKind::ConfigMap, BundleKind::Secret];

    pub fn as_str(self) -> &'static str {
        match self {
            BundleKind::ConfigMap => "ConfigMap",
            BundleKind::Secret => "Secret",
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A modified bundle, identified by `(kind, name)`. Used as the change debounce key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeDescriptor {
    pub kind: BundleKind,
    pub name: String,
}

impl ChangeDescriptor {
    pub fn new(kind: BundleKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

impl fmt::Display for ChangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// A queued workload update keyed by `(name, observed_version)`.
///
/// A newer observed version is a distinct key: it is never coalesced with a
/// ref taken from an older version of the same workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub name: String,
    pub observed_version: String,
}

impl WorkloadRef {
    pub fn new(name: impl Into<String>, observed_version: impl Into<String>) -> Self {
        Self { name: name.into(), observed_version: observed_version.into() }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.observed_version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One normalized event from a bundle watch stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleEvent {
    pub event_type: WatchEventType,
    /// Resource name; `None` for error events and nameless bodies.
    pub name: Option<String>,
}

impl BundleEvent {
    /// Change descriptor for this event, only when it is a named modification.
    pub fn modification(&self, kind: BundleKind) -> Option<ChangeDescriptor> {
        match (self.event_type, self.name.as_deref()) {
            (WatchEventType::Modified, Some(name)) => Some(ChangeDescriptor::new(kind, name)),
            _ => None,
        }
    }
}

/// How to reach the cluster API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    InCluster,
    Endpoint(String),
}

impl Connection {
    /// In-cluster discovery wins when the service env is present; otherwise an explicit host is required.
    pub fn select(in_cluster: bool, host: Option<&str>) -> Result<Self> {
        if in_cluster {
            return Ok(Connection::InCluster);
        }
        match host.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => Ok(Connection::Endpoint(h.to_string())),
            None => Err(Error::MissingHost),
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            Connection::InCluster => "in-cluster",
            Connection::Endpoint(h) => h.as_str(),
        }
    }
}

/// Process settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub delay: Duration,
    pub connection: Connection,
}

impl Settings {
    pub fn new(namespace: Option<&str>, delay_secs: Option<&str>, connection: Connection) -> Result<Self> {
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();
        let delay = match delay_secs.filter(|d| !d.is_empty()) {
            Some(raw) => parse_delay(raw)?,
            None => Duration::from_secs(DEFAULT_DELAY_SECS),
        };
        Ok(Self { namespace, delay, connection })
    }
}

pub fn parse_delay(raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::InvalidDelay(raw.to_string()))
}

pub mod prelude {
    pub use super::{BundleEvent, BundleKind, ChangeDescriptor, Connection, Settings, WatchEventType, WorkloadRef};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_named_modifications_become_changes() {
        let ev = |t, n: Option<&str>| BundleEvent { event_type: t, name: n.map(str::to_string) };
        assert_eq!(
            ev(WatchEventType::Modified, Some("cfg-a")).modification(BundleKind::ConfigMap),
            Some(ChangeDescriptor::new(BundleKind::ConfigMap, "cfg-a"))
        );
        assert!(ev(WatchEventType::Added, Some("cfg-a")).modification(BundleKind::ConfigMap).is_none());
        assert!(ev(WatchEventType::Deleted, Some("cfg-a")).modification(BundleKind::Secret).is_none());
        assert!(ev(WatchEventType::Error, None).modification(BundleKind::Secret).is_none());
        assert!(ev(WatchEventType::Modified, None).modification(BundleKind::Secret).is_none());
    }

    #[test]
    fn descriptors_differ_by_kind() {
        let a = ChangeDescriptor::new(BundleKind::ConfigMap, "app-config");
        let b = ChangeDescriptor::new(BundleKind::Secret, "app-config");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "ConfigMap app-config");
    }

    #[test]
    fn connection_prefers_in_cluster() {
        assert_eq!(Connection::select(true, Some("http://localhost:8001")).unwrap(), Connection::InCluster);
        assert_eq!(
            Connection::select(false, Some("http://localhost:8001")).unwrap(),
            Connection::Endpoint("http://localhost:8001".into())
        );
        assert!(matches!(Connection::select(false, None), Err(Error::MissingHost)));
        assert!(matches!(Connection::select(false, Some("  ")), Err(Error::MissingHost)));
    }

    #[test]
    fn settings_defaults_and_delay_parsing() {
        let s = Settings::new(None, None, Connection::InCluster).unwrap();
        assert_eq!(s.namespace, "default");
        assert_eq!(s.delay, Duration::from_secs(5));

        let s = Settings::new(Some("prod"), Some("12"), Connection::InCluster).unwrap();
        assert_eq!(s.namespace, "prod");
        assert_eq!(s.delay, Duration::from_secs(12));

        assert!(matches!(
            Settings::new(None, Some("5s"), Connection::InCluster),
            Err(Error::InvalidDelay(_))
        ));
    }
}
