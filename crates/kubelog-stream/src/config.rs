//! Runtime settings for the hub and tailers.

use kubelog_core::{Config, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_BYTES, DEFAULT_TAIL_LINES};

/// Broadcast hub capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Inbound queue shared by all producers.
    pub inbound_buffer: usize,
    /// Outbound queue per subscriber. A subscriber whose queue is full when
    /// a message arrives is dropped.
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: 1024,
            subscriber_buffer: 256,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            inbound_buffer: config.hub_buffer.max(1),
            subscriber_buffer: config.subscriber_buffer.max(1),
        }
    }
}

/// Per-container tail settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailConfig {
    /// History lines requested when the stream opens.
    pub tail_lines: i64,
    /// Maximum bytes per emitted chunk.
    pub chunk_size: usize,
    /// Longest line read from the log stream before it is cut.
    pub max_line_bytes: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl From<&Config> for TailConfig {
    fn from(config: &Config) -> Self {
        Self {
            tail_lines: config.tail_lines,
            chunk_size: config.chunk_size,
            max_line_bytes: config.max_line_bytes,
        }
    }
}
