use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::FileLoadError;

pub const DEFAULT_WS_URL: &str = "wss://gameconnect-latest.onrender.com/ws";

/// `client.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub ws_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Base delay; attempt `n` waits `n * reconnect_delay_ms`.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// Ask for a fresh chat list whenever chat activity arrives.
    pub refresh_chats_on_activity: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_owned(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            refresh_chats_on_activity: true,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, serde_json::Error> {
    serde_json::from_str::<ClientConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, FileLoadError> {
    let data = read_capped(path, MAX_CONFIG_BYTES)?;
    parse_config_json(&data).map_err(FileLoadError::Parse)
}

/// Reads a whole text file, refusing anything larger than `max` bytes.
pub(crate) fn read_capped(path: &Path, max: u64) -> Result<String, FileLoadError> {
    let meta = fs::metadata(path).map_err(FileLoadError::Metadata)?;
    if meta.len() > max {
        return Err(FileLoadError::TooLarge {
            size: meta.len(),
            max,
        });
    }
    fs::read_to_string(path).map_err(FileLoadError::Read)
}
