//! Core types and configuration for kubelog.
//!
//! This crate provides the wire model broadcast to subscribers, the line
//! chunking policy, configuration management, and the error type used
//! across the kubelog workspace.

pub mod chunk;
mod config;
mod error;
mod message;

pub use chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_BYTES, chunk_line, parse_chunk};
pub use config::{Config, DEFAULT_TAIL_LINES};
pub use error::{Error, Result};
pub use message::{
    Envelope, POD_LOGS_RECEIVED, PodLogMessage, WorkloadKey, WorkloadKind, WorkloadRef,
};
