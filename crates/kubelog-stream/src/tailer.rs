//! Per-container log tailing.

use std::sync::Arc;

use futures_util::StreamExt;
use kubelog_core::{Envelope, PodLogMessage, WorkloadKey, chunk_line, parse_chunk};
use kubelog_kube::{ClusterApi, LogRequest, TailTarget};

use crate::{CancelSignal, HubHandle, TailConfig};

/// Why a tailer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    /// The workload's stream was stopped or replaced.
    Cancelled,
    /// The log stream ended (container exited or the API closed it).
    StreamEnded,
    /// Reading the log stream failed.
    ReadFailed,
    /// The log stream could not be opened.
    OpenFailed,
    /// The hub shut down.
    HubClosed,
}

/// Follows one container's log and pushes each chunk into the hub.
pub struct Tailer {
    api: Arc<dyn ClusterApi>,
    hub: HubHandle,
    config: TailConfig,
    workload: WorkloadKey,
    target: TailTarget,
}

impl Tailer {
    /// Create a tailer for one container of `workload`.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        hub: HubHandle,
        config: TailConfig,
        workload: WorkloadKey,
        target: TailTarget,
    ) -> Self {
        Self {
            api,
            hub,
            config,
            workload,
            target,
        }
    }

    /// Tail until cancelled or the stream ends.
    ///
    /// The log stream is owned by this future, so it is closed on every
    /// exit path.
    pub async fn run(self, mut cancel: CancelSignal) -> TailOutcome {
        let request = LogRequest::follow_tail(
            self.target.pod.as_str(),
            self.target.container.as_str(),
            self.config.tail_lines,
            self.config.max_line_bytes,
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return TailOutcome::Cancelled,
            opened = self.api.open_log_stream(&self.workload.namespace, &request) => opened,
        };

        let mut lines = match opened {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(
                    workload = %self.workload,
                    pod = %self.target.pod,
                    container = %self.target.container,
                    error = %e,
                    "Failed to open log stream"
                );
                return TailOutcome::OpenFailed;
            }
        };

        tracing::debug!(
            workload = %self.workload,
            pod = %self.target.pod,
            container = %self.target.container,
            "Tailing container"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break TailOutcome::Cancelled,
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if !self.publish(&line).await {
                            break TailOutcome::HubClosed;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            workload = %self.workload,
                            pod = %self.target.pod,
                            container = %self.target.container,
                            error = %e,
                            "Log stream read failed"
                        );
                        break TailOutcome::ReadFailed;
                    }
                    None => break TailOutcome::StreamEnded,
                },
            }
        };

        drop(lines);
        tracing::debug!(
            workload = %self.workload,
            pod = %self.target.pod,
            container = %self.target.container,
            ?outcome,
            "Tailer finished"
        );
        outcome
    }

    /// Push every chunk of `line`. Returns `false` once the hub is closed.
    async fn publish(&self, line: &str) -> bool {
        for chunk in chunk_line(line, self.config.chunk_size) {
            let (timestamp, message) = parse_chunk(chunk);
            let envelope = Envelope::pod_logs(PodLogMessage {
                timestamp: timestamp.to_string(),
                container: self.target.container.clone(),
                pod: self.target.pod.clone(),
                workload: self.workload.to_string(),
                message: message.to_string(),
            });

            let bytes = match envelope.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(
                        workload = %self.workload,
                        pod = %self.target.pod,
                        container = %self.target.container,
                        error = %e,
                        "Failed to encode log chunk"
                    );
                    continue;
                }
            };

            if self.hub.broadcast(bytes).await.is_err() {
                return false;
            }
        }
        true
    }
}
