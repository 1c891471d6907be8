//! Per-record sync lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status stored on every syncable local record.
///
/// `pending` and `failed` records are dirty: they win over any remote state
/// until a push succeeds. Remote-driven writes only ever produce `synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Created or edited locally, not yet acknowledged by the server
    #[default]
    Pending,
    /// Last push attempt errored
    Failed,
    /// Server and local agree as of the last round-trip
    Synced,
}

impl SyncStatus {
    /// Stable storage representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Synced => "synced",
        }
    }

    /// True for `pending` and `failed`
    pub const fn is_dirty(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "synced" => Ok(Self::Synced),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// Entity families known to the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Visit,
    Trip,
    Place,
}

impl EntityKind {
    /// Remote collection holding this family.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Visit => "visits",
            Self::Trip => "trips",
            Self::Place => "places",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Visit => "visit",
            Self::Trip => "trip",
            Self::Place => "place",
        })
    }
}

/// Common surface of records that carry a [`SyncStatus`].
pub trait SyncEntity: Clone + Send + Sync + 'static {
    /// Family this record belongs to
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Replace the identifier, used to keep the local spelling when merging
    /// a remote record whose identifier differs only in case.
    fn set_id(&mut self, id: String);

    fn updated_at(&self) -> DateTime<Utc>;

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>);

    fn sync_status(&self) -> SyncStatus;

    fn set_sync_status(&mut self, status: SyncStatus);
}
