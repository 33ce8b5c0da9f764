//! Error types for kubelog.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kubelog.
#[derive(Debug, Error)]
pub enum Error {
    /// Workload not found.
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    /// Kubernetes API error.
    #[error("kubernetes error: {0}")]
    Kube(String),

    /// A container log stream could not be opened.
    #[error("log stream error for {pod}/{container}: {message}")]
    LogStream {
        /// Pod name.
        pod: String,
        /// Container name.
        container: String,
        /// Underlying failure.
        message: String,
    },

    /// The broadcast hub has shut down.
    #[error("broadcast hub is closed")]
    HubClosed,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse error.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
