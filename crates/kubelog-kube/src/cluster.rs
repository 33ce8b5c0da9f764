//! The slice of the Kubernetes API that log streaming consumes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use kubelog_core::{Result, WorkloadKey, WorkloadKind};

/// Lines of one container log stream, newline stripped.
///
/// Dropping the stream closes the underlying API connection.
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// A pod as seen by the target resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Init container names, in pod spec order.
    pub init_containers: Vec<String>,
    /// Regular container names, in pod spec order.
    pub containers: Vec<String>,
}

impl PodSummary {
    /// Container names to tail: init containers first, then regular ones.
    pub fn tail_containers(&self) -> impl Iterator<Item = &str> {
        self.init_containers
            .iter()
            .chain(&self.containers)
            .map(String::as_str)
    }
}

/// Parameters for opening one container log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    /// Pod name.
    pub pod: String,
    /// Container name.
    pub container: String,
    /// History lines to send before following. `None` sends everything.
    pub tail_lines: Option<i64>,
    /// Keep the stream open for new lines.
    pub follow: bool,
    /// Prefix each line with its RFC 3339 timestamp.
    pub timestamps: bool,
    /// Longest line to read before cutting it.
    pub max_line_bytes: usize,
}

impl LogRequest {
    /// A following, timestamped stream starting `tail_lines` back.
    pub fn follow_tail(
        pod: impl Into<String>,
        container: impl Into<String>,
        tail_lines: i64,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            pod: pod.into(),
            container: container.into(),
            tail_lines: Some(tail_lines),
            follow: true,
            timestamps: true,
            max_line_bytes,
        }
    }
}

/// Kubernetes operations needed to resolve and tail workloads.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Equality selector (`matchLabels`) of a workload.
    async fn workload_selector(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<BTreeMap<String, String>>;

    /// All pods in a namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>>;

    /// Open a container log stream.
    async fn open_log_stream(&self, namespace: &str, request: &LogRequest) -> Result<LogLines>;
}
