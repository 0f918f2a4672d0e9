//! Settings types.
//!
//! All sections use camelCase keys on disk and `#[serde(default)]`, so a
//! settings file only needs the values it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HuddleSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Message formatting and file limits.
    pub chat: ChatSettings,
    /// Local file storage settings.
    pub storage: StorageSettings,
    /// Session token table.
    pub auth: AuthSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl HuddleSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if server.heartbeat_timeout_ms < server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) is shorter than server.heartbeatIntervalMs ({})",
                server.heartbeat_timeout_ms, server.heartbeat_interval_ms
            )));
        }
        if server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be positive".into(),
            ));
        }
        let message_limit = u64::try_from(server.max_message_size).unwrap_or(u64::MAX);
        if self.chat.max_file_bytes > message_limit {
            // the payload travels as one binary message
            return Err(SettingsError::InvalidValue(format!(
                "chat.maxFileBytes ({}) exceeds server.maxMessageSize ({})",
                self.chat.max_file_bytes, server.max_message_size
            )));
        }
        if let Some((token, _)) = self.auth.tokens.iter().find(|(_, name)| name.trim().is_empty())
        {
            return Err(SettingsError::InvalidValue(format!(
                "auth.tokens entry {token:?} has a blank display name"
            )));
        }
        Ok(())
    }
}

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Interval between server Ping frames, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is closed, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum size of one inbound WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before drops start.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_connections: 1_000,
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 256,
        }
    }
}

/// Message formatting and file limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    /// Append ` (HH:MM)` to every broadcast message.
    pub timestamps: bool,
    /// Largest file accepted through the file-pair protocol, in bytes.
    pub max_file_bytes: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            timestamps: false,
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Local file storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Directory shared files are written under.
    pub root_dir: String,
    /// URL prefix announced for stored files.
    pub public_url_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: "uploads".to_string(),
            public_url_prefix: "/files".to_string(),
        }
    }
}

/// Session token table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Session token to display name.
    pub tokens: BTreeMap<String, String>,
    /// Admit connections that present no token as `anonymous-<id>`.
    pub allow_anonymous: bool,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` syntax accepted).
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
