/// Runtime configuration for the collaboration core
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CollaborationError, ConflictResolutionPolicy, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollaborationConfig {
    /// Period of the per-session sync tick
    pub tick_interval_ms: u64,

    /// Participants silent for longer than this are marked inactive
    pub inactivity_threshold_secs: i64,

    /// Queue length that triggers trimming
    pub queue_capacity: usize,

    /// Number of most recent entries kept after trimming
    pub queue_trim_to: usize,

    /// Maximum gap between two edits that may be composed into one
    pub compose_window_ms: i64,

    /// TTL used when a lock request does not carry one
    pub default_lock_ttl_ms: i64,

    /// Capacity of each session actor's command channel
    pub command_buffer: usize,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,

    /// Policy assigned to newly created sessions
    pub conflict_policy: ConflictResolutionPolicy,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            inactivity_threshold_secs: 30,
            queue_capacity: 1000,
            queue_trim_to: 500,
            compose_window_ms: 1000,
            default_lock_ttl_ms: 30_000,
            command_buffer: 256,
            event_buffer: 1000,
            conflict_policy: ConflictResolutionPolicy::default(),
        }
    }
}

impl CollaborationConfig {
    /// Load configuration from a JSON file, falling back to defaults for missing keys
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            CollaborationError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(CollaborationError::Config(
                "tickIntervalMs must be greater than zero".to_string(),
            ));
        }

        if self.queue_trim_to >= self.queue_capacity {
            return Err(CollaborationError::Config(format!(
                "queueTrimTo ({}) must be smaller than queueCapacity ({})",
                self.queue_trim_to, self.queue_capacity
            )));
        }

        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(CollaborationError::Config(
                "channel buffers must be non-empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_threshold_secs)
    }

    pub fn compose_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.compose_window_ms)
    }

    pub fn default_lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_lock_ttl_ms)
    }
}
