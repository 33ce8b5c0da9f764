//! Entry point tying resolution, registration and tailing together.

use std::sync::Arc;

use kubelog_core::{Result, WorkloadKey, WorkloadRef};
use kubelog_kube::{ClusterApi, resolve_targets};

use crate::{HubHandle, StreamRegistry, TailConfig, Tailer};

/// Starts and stops live log streams for workloads.
pub struct LogStreamer {
    api: Arc<dyn ClusterApi>,
    hub: HubHandle,
    registry: StreamRegistry,
    config: TailConfig,
}

impl LogStreamer {
    /// Create a streamer publishing into `hub`.
    pub fn new(api: Arc<dyn ClusterApi>, hub: HubHandle, config: TailConfig) -> Self {
        Self {
            api,
            hub,
            registry: StreamRegistry::new(),
            config,
        }
    }

    /// Start tailing every container currently backing `workload`.
    ///
    /// Returns the number of tail sessions started. A streaming session
    /// already running for the same key is replaced. Resolution failures are
    /// logged and returned; nothing is registered in that case.
    pub async fn start_streaming(&self, workload: &WorkloadRef) -> Result<usize> {
        let targets = match resolve_targets(self.api.as_ref(), workload).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!(workload = %workload.key, kind = %workload.kind, error = %e, "Failed to resolve log targets");
                return Err(e);
            }
        };

        let signal = self.registry.register(workload.key.clone()).await;
        let sessions = targets.len();

        for target in targets {
            let tailer = Tailer::new(
                Arc::clone(&self.api),
                self.hub.clone(),
                self.config,
                workload.key.clone(),
                target,
            );
            tokio::spawn(tailer.run(signal.clone()));
        }

        if sessions == 0 {
            tracing::warn!(workload = %workload.key, "No running containers matched workload");
        } else {
            tracing::info!(workload = %workload.key, sessions, "Started log streaming");
        }

        Ok(sessions)
    }

    /// Stop streaming `key` and wait for its tailers to exit.
    pub async fn stop_streaming(&self, key: &WorkloadKey) -> bool {
        self.registry.stop(key).await
    }

    /// Stop every stream and wait for all tailers to exit.
    pub async fn stop_all_streaming(&self) -> usize {
        self.registry.stop_all().await
    }

    /// Keys of the workloads currently streaming.
    pub async fn active_streams(&self) -> Vec<WorkloadKey> {
        self.registry.active_keys().await
    }
}
