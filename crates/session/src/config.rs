// Client configuration.
//
// File config: `~/.tandem/config.toml`
// Environment: `TANDEM_SIGNALING_URL` overrides the file's signaling URL.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use tandem_common::signaling::room_name;

use crate::reconnect::ReconnectPolicy;

/// Signaling endpoint used when nothing else is configured.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:4444";
/// Environment variable that overrides the configured signaling endpoint.
pub const SIGNALING_URL_ENV: &str = "TANDEM_SIGNALING_URL";
/// `tokio::time::interval` rejects a zero period.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Root directory for tandem client state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the client config file: `~/.tandem/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Session config ─────────────────────────────────────────────────

/// Identity of the local participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: String,
    pub name: String,
    /// Cursor color; a palette color is picked at connect time when unset.
    pub color: Option<String>,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), color: None }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Everything needed to join one document's session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub document_id: String,
    pub user: LocalUser,
    pub signaling_url: String,
    /// Explicit room; defaults to `document-<document_id>`.
    pub room: Option<String>,
    /// Pins the CRDT client id of the replica. Random when unset.
    pub replica_id: Option<u64>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub cursor_debounce: Duration,
    /// Remote presence silent for longer than this is evicted locally.
    pub stale_after: Duration,
    /// Maximum number of retained, and consecutive, local undo steps.
    pub undo_depth: usize,
}

impl SessionConfig {
    pub fn new(document_id: impl Into<String>, user: LocalUser) -> Self {
        TimingConfig::default().apply(Self {
            document_id: document_id.into(),
            user,
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room: None,
            replica_id: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::ZERO,
            cursor_debounce: Duration::ZERO,
            stale_after: Duration::ZERO,
            undo_depth: 0,
        })
    }

    pub fn room_name(&self) -> String {
        room_name(&self.document_id, self.room.as_deref())
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_replica_id(mut self, replica_id: u64) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_cursor_debounce(mut self, window: Duration) -> Self {
        self.cursor_debounce = window;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

// ── File config ────────────────────────────────────────────────────

/// Client configuration at `~/.tandem/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling relay URL (e.g. `wss://relay.example.com`).
    pub signaling_url: Option<String>,
    /// Stable user id; generated by the CLI when unset.
    pub user_id: Option<String>,
    /// Default display name.
    pub display_name: Option<String>,
    /// Default cursor color.
    pub color: Option<String>,
    /// Timers and limits.
    pub timing: TimingConfig,
}

impl ClientConfig {
    /// Load from `~/.tandem/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Effective signaling URL: environment, then file, then the default.
    pub fn resolved_signaling_url(&self) -> String {
        self.resolved_signaling_url_with(|key| std::env::var(key))
    }

    fn resolved_signaling_url_with<F>(&self, env: F) -> String
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        env(SIGNALING_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.signaling_url.clone())
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string())
    }

    /// Assemble a session config for `document_id` with these defaults.
    pub fn session_config(&self, document_id: impl Into<String>, user: LocalUser) -> SessionConfig {
        let config = SessionConfig::new(document_id, user)
            .with_signaling_url(self.resolved_signaling_url());
        self.timing.apply(config)
    }
}

/// Timer and limit settings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub cursor_debounce_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Defaults to three heartbeat intervals.
    pub stale_after_ms: u64,
    pub undo_depth: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            cursor_debounce_ms: 50,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
            stale_after_ms: 90_000,
            undo_depth: 100,
        }
    }
}

impl TimingConfig {
    fn apply(&self, mut config: SessionConfig) -> SessionConfig {
        config.heartbeat_interval =
            Duration::from_millis(self.heartbeat_interval_ms).max(MIN_HEARTBEAT_INTERVAL);
        config.cursor_debounce = Duration::from_millis(self.cursor_debounce_ms);
        config.stale_after = Duration::from_millis(self.stale_after_ms);
        config.undo_depth = self.undo_depth;
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        };
        config
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
