//! Coarse sync state shared with presentation code.

use chrono::{DateTime, Utc};

/// Unified sync state reported to clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// No connectivity; changes stay local.
    Offline,
    /// A sync round is running.
    Syncing,
    /// The last round finished without errors.
    #[default]
    Synced,
    /// The last round finished with at least one failed phase.
    Error,
}

/// Point-in-time view of the engine, readable from any caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub state: SyncState,
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Dirty records plus deletions not yet confirmed remotely.
    pub pending_count: usize,
    pub rounds_completed: u64,
}
