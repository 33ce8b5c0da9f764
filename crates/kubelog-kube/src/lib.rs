//! Kubernetes access for kubelog.
//!
//! This crate defines the slice of the Kubernetes API that log streaming
//! needs, implements it on top of `kube`, and resolves workloads into the
//! pod containers to tail.

mod client;
mod cluster;
mod lines;
mod resolve;

pub use client::KubeCluster;
pub use cluster::{ClusterApi, LogLines, LogRequest, PodSummary};
pub use lines::lines_lossy;
pub use resolve::{TailTarget, resolve_targets, selector_matches};
