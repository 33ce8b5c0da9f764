//! Workload identity and the wire model broadcast to subscribers.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Envelope type for container log chunks.
pub const POD_LOGS_RECEIVED: &str = "POD_LOGS_RECEIVED";

/// Identity of a streamed workload: `namespace/name`.
///
/// The key does not include the workload kind, so a Deployment and a
/// StatefulSet sharing a name in one namespace share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    /// Namespace.
    pub namespace: String,
    /// Workload name.
    pub name: String,
}

impl WorkloadKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for WorkloadKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::Config(format!(
                "invalid workload '{s}', expected <namespace>/<name>"
            ))),
        }
    }
}

/// Kind of workload whose pod selector picks the pods to tail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// apps/v1 Deployment.
    #[default]
    Deployment,
    /// apps/v1 StatefulSet.
    StatefulSet,
    /// apps/v1 DaemonSet.
    DaemonSet,
    /// apps/v1 ReplicaSet.
    ReplicaSet,
}

impl WorkloadKind {
    /// All supported kinds.
    pub fn all() -> &'static [Self] {
        &[
            Self::Deployment,
            Self::StatefulSet,
            Self::DaemonSet,
            Self::ReplicaSet,
        ]
    }

    /// Lowercase name as accepted on the command line.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
            Self::ReplicaSet => "replicaset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "Deployment"),
            Self::StatefulSet => write!(f, "StatefulSet"),
            Self::DaemonSet => write!(f, "DaemonSet"),
            Self::ReplicaSet => write!(f, "ReplicaSet"),
        }
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|kind| {
                kind.short_name() == lower || format!("{}s", kind.short_name()) == lower
            })
            .or(match lower.as_str() {
                "deploy" => Some(Self::Deployment),
                "sts" => Some(Self::StatefulSet),
                "ds" => Some(Self::DaemonSet),
                "rs" => Some(Self::ReplicaSet),
                _ => None,
            })
            .ok_or_else(|| Error::Config(format!("unsupported workload kind: {s}")))
    }
}

/// A workload to stream logs for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    /// Kind used to look up the pod selector.
    pub kind: WorkloadKind,
    /// Namespace and name.
    pub key: WorkloadKey,
}

impl WorkloadRef {
    /// Create a new workload reference.
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            key: WorkloadKey::new(namespace, name),
        }
    }

    /// Reference a Deployment.
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Deployment, namespace, name)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.short_name(), self.key)
    }
}

/// One chunk of one container log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLogMessage {
    /// Leading token of the chunk, or empty.
    pub timestamp: String,
    /// Container name.
    pub container: String,
    /// Pod name.
    pub pod: String,
    /// Origin workload as `namespace/name`.
    pub workload: String,
    /// Chunk text after the timestamp.
    pub message: String,
}

/// Typed wrapper for everything the hub relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Event discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event body.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap a payload with an explicit event type.
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the JSON bytes handed to the hub.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl Envelope<PodLogMessage> {
    /// Wrap a log chunk.
    pub fn pod_logs(message: PodLogMessage) -> Self {
        Self::new(POD_LOGS_RECEIVED, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_key_roundtrip() {
        let key: WorkloadKey = "ns/app".parse().unwrap();
        assert_eq!(key, WorkloadKey::new("ns", "app"));
        assert_eq!(key.to_string(), "ns/app");
    }

    #[test]
    fn test_workload_key_rejects_malformed() {
        for input in ["app", "/app", "ns/", "ns/a/b", ""] {
            assert!(input.parse::<WorkloadKey>().is_err(), "{input}");
        }
    }

    #[test]
    fn test_workload_kind_aliases() {
        assert_eq!("Deployment".parse::<WorkloadKind>().unwrap(), WorkloadKind::Deployment);
        assert_eq!("sts".parse::<WorkloadKind>().unwrap(), WorkloadKind::StatefulSet);
        assert_eq!("daemonsets".parse::<WorkloadKind>().unwrap(), WorkloadKind::DaemonSet);
        assert!("cronjob".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::pod_logs(PodLogMessage {
            timestamp: "2024-01-01T00:00:00Z".into(),
            container: "main".into(),
            pod: "app-abc".into(),
            workload: WorkloadKey::new("ns", "app").to_string(),
            message: "ready".into(),
        });

        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "POD_LOGS_RECEIVED",
                "payload": {
                    "timestamp": "2024-01-01T00:00:00Z",
                    "container": "main",
                    "pod": "app-abc",
                    "workload": "ns/app",
                    "message": "ready"
                }
            })
        );
    }
}
