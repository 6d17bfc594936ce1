//! Session configuration
//!
//! All timers of a replica session. Every field has a default, so an empty
//! JSON object is a valid configuration:
//!
//! ```rust
//! use docsync_core::config::SyncConfig;
//!
//! let config = SyncConfig::from_json_str(r#"{ "flushDebounceMs": 20 }"#).unwrap();
//! assert_eq!(config.flush_debounce_ms, 20);
//! assert_eq!(config.cursor_interval_ms, 100);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::presence::INACTIVITY_LIMIT_MS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Quiet period before captured edits are flushed
    pub flush_debounce_ms: u64,

    /// How often the local caret is checked and broadcast
    pub cursor_interval_ms: u64,

    /// Resend an unchanged caret this often so peers do not expire it
    pub cursor_heartbeat_ms: u64,

    /// How often a snapshot is persisted (only when new entries were seen)
    pub persist_interval_ms: u64,

    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,

    /// How many recent sequence ids are remembered for duplicate detection
    pub seen_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_debounce_ms: 50,
            cursor_interval_ms: 100,
            cursor_heartbeat_ms: 5_000,
            persist_interval_ms: 1_000,
            reconnect_interval_ms: 1_000,
            seen_window: 4_096,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("flushDebounceMs", self.flush_debounce_ms),
            ("cursorIntervalMs", self.cursor_interval_ms),
            ("persistIntervalMs", self.persist_interval_ms),
            ("reconnectIntervalMs", self.reconnect_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{} must be positive", name)));
        }
        if self.cursor_heartbeat_ms == 0 || self.cursor_heartbeat_ms as i64 >= INACTIVITY_LIMIT_MS {
            return Err(SyncError::Config(format!(
                "cursorHeartbeatMs must be between 1 and {}",
                INACTIVITY_LIMIT_MS - 1
            )));
        }
        if self.seen_window == 0 {
            return Err(SyncError::Config("seenWindow must be positive".into()));
        }
        Ok(())
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
