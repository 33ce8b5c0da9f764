//! Configuration management.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_BYTES};
use crate::{Error, Result};

/// Number of history lines requested when a tail session opens.
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kubeconfig context to use. `None` selects the current context.
    pub context: Option<String>,
    /// History lines requested per container before following.
    pub tail_lines: i64,
    /// Maximum bytes per emitted log chunk.
    pub chunk_size: usize,
    /// Longest line read from a container before it is cut.
    pub max_line_bytes: usize,
    /// Capacity of the hub's inbound queue.
    pub hub_buffer: usize,
    /// Capacity of each subscriber's outbound queue.
    pub subscriber_buffer: usize,
    /// Listen address for `kubelog serve`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent TCP subscribers (0 = unlimited).
    pub max_subscribers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context: None,
            tail_lines: DEFAULT_TAIL_LINES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            hub_buffer: 1024,
            subscriber_buffer: 256,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            max_subscribers: 0,
        }
    }
}

impl Config {
    /// Load configuration from disk or create default.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the streaming pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.max_line_bytes < self.chunk_size {
            return Err(Error::Config("max_line_bytes must be at least chunk_size".into()));
        }
        if self.hub_buffer == 0 || self.subscriber_buffer == 0 {
            return Err(Error::Config("buffer sizes must be greater than zero".into()));
        }
        if self.tail_lines < 0 {
            return Err(Error::Config("tail_lines must not be negative".into()));
        }
        Ok(())
    }

    /// Get configuration file path.
    fn config_path() -> Result<PathBuf> {
        ProjectDirs::from("", "", "kubelog")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| Error::Config("could not determine config directory".into()))
    }
}
