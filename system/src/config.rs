use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs of a collaboration session. Every field has a default, so a
/// config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cursor events per client are coalesced into one message per interval.
    pub cursor_interval_ms: u64,
    /// Fraction of the viewport added on each side when culling.
    pub viewport_margin: f32,
    pub grid_cell_size: f32,
    /// Accepted updates kept for resuming clients.
    pub replay_log_capacity: usize,
    /// Largest gap a resuming client may have before it gets a snapshot.
    pub replay_threshold: u64,
    pub reconnect_grace_ms: u64,
    /// How long a session with no members lives on.
    pub session_grace_ms: u64,
    pub tombstone_limit: usize,
    pub tombstone_ttl_ms: u64,
    /// Recently accepted message ids remembered for duplicate detection.
    pub dedupe_window: usize,
    pub max_members: usize,
    pub snapshot_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cursor_interval_ms: 33,
            viewport_margin: 0.2,
            grid_cell_size: 256.0,
            replay_log_capacity: 1024,
            replay_threshold: 512,
            reconnect_grace_ms: 30_000,
            session_grace_ms: 30_000,
            tombstone_limit: 10_000,
            tombstone_ttl_ms: 120_000,
            dedupe_window: 4096,
            max_members: 64,
            snapshot_chunk_size: 500,
        }
    }
}

impl EngineConfig {
    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }
}
