//! Server configuration loaded from `server.json`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use como_protocol::DEFAULT_MAX_FRAME_SIZE;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 4242;

/// Frames queued per observer before it is considered too slow
pub const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

const KNOWN_FIELDS: &[&str] = &["listen", "maxFrameSize", "outboundBuffer"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address the server accepts observers on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Largest accepted frame, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound frames buffered per observer
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_frame_size: default_max_frame_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ServerConfig {
    /// Default config file location (`~/.config/como/server.json` on Linux).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "como").map(|dirs| dirs.config_dir().join("server.json"))
    }

    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, contains invalid JSON, or
    /// holds values that fail [`ServerConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        warn_unknown_fields(&content);
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(ServerError::InvalidConfig(
                "maxFrameSize must be at least 1".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ServerError::InvalidConfig(
                "outboundBuffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn warn_unknown_fields(content: &str) {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) else {
        return;
    };

    for key in obj.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            warn!("Unknown config field in server.json: {key}");
        }
    }
}
