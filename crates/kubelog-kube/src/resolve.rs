//! Resolution of a workload into the (pod, container) pairs to tail.

use std::collections::BTreeMap;

use kubelog_core::{Result, WorkloadRef};

use crate::ClusterApi;

/// One container log to follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TailTarget {
    /// Pod name.
    pub pod: String,
    /// Container name.
    pub container: String,
}

impl TailTarget {
    /// Create a new target.
    pub fn new(pod: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            container: container.into(),
        }
    }
}

/// Whether `labels` carries every key of `selector` with the same value.
///
/// An empty selector matches every pod.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Find every container that currently backs `workload`.
///
/// Pods keep the order the API listed them in; within a pod, init
/// containers come before regular containers.
pub async fn resolve_targets(api: &dyn ClusterApi, workload: &WorkloadRef) -> Result<Vec<TailTarget>> {
    let selector = api.workload_selector(workload.kind, &workload.key).await?;
    let pods = api.list_pods(&workload.key.namespace).await?;

    let targets: Vec<TailTarget> = pods
        .iter()
        .filter(|pod| selector_matches(&selector, &pod.labels))
        .flat_map(|pod| {
            pod.tail_containers()
                .map(|container| TailTarget::new(pod.name.as_str(), container))
        })
        .collect();

    tracing::debug!(
        workload = %workload.key,
        kind = %workload.kind,
        pods = pods.len(),
        targets = targets.len(),
        "Resolved tail targets"
    );

    Ok(targets)
}
