//! Kubernetes API access backed by `kube`.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, LogParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Resource};
use kubelog_core::{Error, Result, WorkloadKey, WorkloadKind};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::lines::lines_lossy;
use crate::{ClusterApi, LogLines, LogRequest, PodSummary};

/// Lines buffered between the API connection and the tailer.
const LOG_LINE_BUFFER: usize = 256;

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using the default kubeconfig or in-cluster environment.
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kube(e.to_string()))?;
        Ok(Self { client })
    }

    /// Connect using a named kubeconfig context.
    pub async fn with_context(context: &str) -> Result<Self> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::Kube(format!("failed to load context {context}: {e}")))?;
        let client = Client::try_from(config).map_err(|e| Error::Kube(e.to_string()))?;
        Ok(Self { client })
    }

    /// Connect with an optional context override.
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        match context {
            Some(context) => Self::with_context(context).await,
            None => Self::new().await,
        }
    }

    async fn selector_of<K, F>(&self, key: &WorkloadKey, selector: F) -> Result<BTreeMap<String, String>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
        F: FnOnce(K) -> Option<LabelSelector>,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let workload = api.get(&key.name).await.map_err(|e| lookup_error(key, e))?;

        Ok(selector(workload)
            .and_then(|s| s.match_labels)
            .unwrap_or_default())
    }
}

/// A missing workload is reported as such; anything else is an API failure.
fn lookup_error(key: &WorkloadKey, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            Error::WorkloadNotFound(key.to_string())
        }
        e => Error::Kube(format!("failed to get {key}: {e}")),
    }
}

fn summarize(pod: Pod) -> PodSummary {
    let spec = pod.spec.unwrap_or_default();
    PodSummary {
        name: pod.metadata.name.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        init_containers: spec
            .init_containers
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.name)
            .collect(),
        containers: spec.containers.into_iter().map(|c| c.name).collect(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn workload_selector(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<BTreeMap<String, String>> {
        match kind {
            WorkloadKind::Deployment => {
                self.selector_of::<Deployment, _>(key, |w| w.spec.map(|s| s.selector))
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.selector_of::<StatefulSet, _>(key, |w| w.spec.map(|s| s.selector))
                    .await
            }
            WorkloadKind::DaemonSet => {
                self.selector_of::<DaemonSet, _>(key, |w| w.spec.map(|s| s.selector))
                    .await
            }
            WorkloadKind::ReplicaSet => {
                self.selector_of::<ReplicaSet, _>(key, |w| w.spec.map(|s| s.selector))
                    .await
            }
        }
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Kube(format!("failed to list pods in {namespace}: {e}")))?;

        Ok(pods.items.into_iter().map(summarize).collect())
    }

    /// The connection is owned by a forwarding task; dropping the returned
    /// stream stops that task and closes the connection.
    async fn open_log_stream(&self, namespace: &str, request: &LogRequest) -> Result<LogLines> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(request.container.clone()),
            follow: request.follow,
            tail_lines: request.tail_lines,
            timestamps: request.timestamps,
            ..LogParams::default()
        };
        let pod = request.pod.clone();
        let max_line_bytes = request.max_line_bytes;

        let (tx, rx) = mpsc::channel(LOG_LINE_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel();

        tokio::spawn(async move {
            let reader = match api.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e.to_string()));
                    return;
                }
            };

            let mut lines = lines_lossy(Box::pin(reader), max_line_bytes);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    line = lines.next() => match line {
                        Some(line) => {
                            let failed = line.is_err();
                            if tx.send(line).await.is_err() || failed {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let log_error = |message: String| Error::LogStream {
            pod: request.pod.clone(),
            container: request.container.clone(),
            message,
        };

        match opened_rx.await {
            Ok(Ok(())) => Ok(Box::pin(ReceiverStream::new(rx))),
            Ok(Err(message)) => Err(log_error(message)),
            Err(_) => Err(log_error("log stream task exited".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            ..Container::default()
        }
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"app\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn test_summarize_orders_init_containers_first() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("app-abc".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![container("init-1")]),
                containers: vec![container("main"), container("sidecar")],
                ..PodSpec::default()
            }),
            ..Pod::default()
        };

        let summary = summarize(pod);
        assert_eq!(summary.name, "app-abc");
        assert_eq!(summary.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(
            summary.tail_containers().collect::<Vec<_>>(),
            vec!["init-1", "main", "sidecar"]
        );
    }

    #[test]
    fn test_summarize_pod_without_spec() {
        let summary = summarize(Pod::default());
        assert_eq!(summary, PodSummary::default());
        assert_eq!(summary.tail_containers().count(), 0);
    }

    #[test]
    fn test_not_found_maps_to_workload_not_found() {
        let key = WorkloadKey::new("ns", "app");
        assert!(matches!(
            lookup_error(&key, api_error(404)),
            Error::WorkloadNotFound(ref name) if name == "ns/app"
        ));
        assert!(matches!(lookup_error(&key, api_error(403)), Error::Kube(_)));
    }
}
