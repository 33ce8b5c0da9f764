//! Test support for kubelog integration tests.
//!
//! [`FakeCluster`] stands in for the Kubernetes API: workloads, pods and
//! container logs are scripted in memory, and every log stream it hands out
//! is counted until dropped so tests can check that nothing leaks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use kubelog_core::{Envelope, Error, PodLogMessage, Result, WorkloadKey, WorkloadKind};
use kubelog_kube::{ClusterApi, LogLines, LogRequest, PodSummary};
use kubelog_stream::Subscription;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// How long helpers wait before giving up.
pub const WAIT: Duration = Duration::from_secs(2);

type ContainerId = (String, String);

#[derive(Default)]
struct State {
    workloads: HashMap<(WorkloadKind, WorkloadKey), BTreeMap<String, String>>,
    pods: HashMap<String, Vec<PodSummary>>,
    history: HashMap<ContainerId, Vec<String>>,
    feeds: HashMap<ContainerId, mpsc::UnboundedSender<io::Result<String>>>,
    fail_open: HashSet<ContainerId>,
    fail_listing: bool,
    requests: Vec<LogRequest>,
}

/// In-memory Kubernetes API.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    open_streams: Arc<AtomicUsize>,
}

fn id(pod: &str, container: &str) -> ContainerId {
    (pod.to_string(), container.to_string())
}

impl FakeCluster {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a workload with the given `matchLabels`.
    #[must_use]
    pub fn with_workload(self, kind: WorkloadKind, key: &str, selector: &[(&str, &str)]) -> Self {
        let key: WorkloadKey = key.parse().expect("workload key");
        self.state()
            .workloads
            .insert((kind, key), labels(selector));
        self
    }

    /// Add a pod.
    #[must_use]
    pub fn with_pod(
        self,
        namespace: &str,
        name: &str,
        pod_labels: &[(&str, &str)],
        init_containers: &[&str],
        containers: &[&str],
    ) -> Self {
        let pod = PodSummary {
            name: name.to_string(),
            labels: labels(pod_labels),
            init_containers: init_containers.iter().map(ToString::to_string).collect(),
            containers: containers.iter().map(ToString::to_string).collect(),
        };
        self.state()
            .pods
            .entry(namespace.to_string())
            .or_default()
            .push(pod);
        self
    }

    /// Lines already in a container's log when a stream opens.
    #[must_use]
    pub fn with_history(self, pod: &str, container: &str, lines: &[&str]) -> Self {
        self.state()
            .history
            .insert(id(pod, container), lines.iter().map(ToString::to_string).collect());
        self
    }

    /// Make pod listing fail.
    #[must_use]
    pub fn fail_pod_listing(self) -> Self {
        self.state().fail_listing = true;
        self
    }

    /// Make opening one container's log fail.
    #[must_use]
    pub fn fail_open(self, pod: &str, container: &str) -> Self {
        self.state().fail_open.insert(id(pod, container));
        self
    }

    /// Append a line to an open container stream.
    pub fn push_line(&self, pod: &str, container: &str, line: &str) -> bool {
        self.state()
            .feeds
            .get(&id(pod, container))
            .is_some_and(|tx| tx.send(Ok(line.to_string())).is_ok())
    }

    /// Deliver a read error on an open container stream.
    pub fn fail_stream(&self, pod: &str, container: &str) -> bool {
        self.state()
            .feeds
            .get(&id(pod, container))
            .is_some_and(|tx| {
                tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")))
                    .is_ok()
            })
    }

    /// End a container stream as if the container exited.
    pub fn end_stream(&self, pod: &str, container: &str) -> bool {
        self.state().feeds.remove(&id(pod, container)).is_some()
    }

    /// Log streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Every log request received, in order.
    pub fn requests(&self) -> Vec<LogRequest> {
        self.state().requests.clone()
    }

    /// Wait until exactly `count` streams are open.
    pub async fn wait_for_open_streams(&self, count: usize) -> bool {
        eventually(|| self.open_streams() == count).await
    }

    /// Wait until at least `count` log requests have been received.
    pub async fn wait_for_requests(&self, count: usize) -> bool {
        eventually(|| self.state().requests.len() >= count).await
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn workload_selector(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<BTreeMap<String, String>> {
        self.state()
            .workloads
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| Error::WorkloadNotFound(key.to_string()))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let state = self.state();
        if state.fail_listing {
            return Err(Error::Kube(format!("failed to list pods in {namespace}")));
        }
        Ok(state.pods.get(namespace).cloned().unwrap_or_default())
    }

    async fn open_log_stream(&self, _namespace: &str, request: &LogRequest) -> Result<LogLines> {
        let mut state = self.state();
        state.requests.push(request.clone());

        let key = id(&request.pod, &request.container);
        if state.fail_open.contains(&key) {
            return Err(Error::LogStream {
                pod: request.pod.clone(),
                container: request.container.clone(),
                message: "container is waiting to start".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let history = state.history.get(&key).cloned().unwrap_or_default();
        let skip = request
            .tail_lines
            .and_then(|n| usize::try_from(n).ok())
            .map_or(0, |n| history.len().saturating_sub(n));
        for line in history.into_iter().skip(skip) {
            let _ = tx.send(Ok(line));
        }
        if request.follow {
            state.feeds.insert(key, tx);
        }

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(TrackedStream {
            inner: UnboundedReceiverStream::new(rx),
            open: Arc::clone(&self.open_streams),
        }))
    }
}

/// Log stream that decrements the open-stream counter when dropped.
struct TrackedStream {
    inner: UnboundedReceiverStream<io::Result<String>>,
    open: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = io::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Receive and decode the next log envelope, or `None` if the subscription
/// ended. Panics if nothing arrives within [`WAIT`].
pub async fn next_log(subscription: &mut Subscription) -> Option<Envelope<PodLogMessage>> {
    let bytes = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("timed out waiting for envelope")?;
    Some(serde_json::from_slice(&bytes).expect("valid envelope"))
}

/// Assert that nothing arrives on `subscription` for a short while.
pub async fn assert_quiet(subscription: &mut Subscription) {
    let received = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
    assert!(received.is_err(), "unexpected message: {received:?}");
}
