//! Trip model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::sync_status::{EntityKind, SyncEntity, SyncStatus};
use super::visit::new_record_id;
use crate::util::now_utc;

/// A named group of visits, optionally shared with collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub cover_photo_url: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Users allowed to contribute visits
    pub collaborator_ids: Vec<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl Trip {
    /// Create a new locally-authored trip, pending upload
    #[must_use]
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            id: new_record_id(),
            name: name.into(),
            description: None,
            cover_photo_url: None,
            start_date: None,
            end_date: None,
            collaborator_ids: Vec::new(),
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
        }
    }
}

impl SyncEntity for Trip {
    const KIND: EntityKind = EntityKind::Trip;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = updated_at;
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_new_is_pending() {
        let trip = Trip::new("user-1", "Lisbon");
        assert_eq!(trip.name, "Lisbon");
        assert_eq!(trip.sync_status, SyncStatus::Pending);
        assert!(trip.collaborator_ids.is_empty());
    }
}
