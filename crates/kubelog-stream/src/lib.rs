//! Live log streaming for kubelog.
//!
//! This crate provides the per-container tailer, the registry of running
//! streams keyed by workload, the broadcast hub that fans envelopes out to
//! subscribers, and the [`LogStreamer`] that wires them together.

mod config;
mod hub;
mod registry;
mod streamer;
mod tailer;

pub use config::{HubConfig, TailConfig};
pub use hub::{BroadcastHub, HubHandle, Subscription};
pub use registry::{CancelSignal, StreamRegistry};
pub use streamer::LogStreamer;
pub use tailer::{TailOutcome, Tailer};
