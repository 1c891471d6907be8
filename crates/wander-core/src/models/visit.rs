//! Visit model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::sync_status::{EntityKind, SyncEntity, SyncStatus};
use crate::util::now_utc;

/// Prefix of provisional photo references whose upload has not finished.
pub const PLACEHOLDER_PHOTO_PREFIX: &str = "pending-upload://";

/// Generate a new lowercase record identifier (UUID v7, time-sortable).
#[must_use]
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Build a placeholder token for a photo that is still uploading.
#[must_use]
pub fn placeholder_photo_token() -> String {
    format!("{PLACEHOLDER_PHOTO_PREFIX}{}", Uuid::now_v7())
}

/// Check whether a photo reference is a placeholder token.
pub fn is_placeholder_photo(reference: &str) -> bool {
    reference.starts_with(PLACEHOLDER_PHOTO_PREFIX)
}

/// How much the visit was enjoyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    MustSee,
    Great,
    Skip,
    /// Also the fallback for ratings this client does not know yet.
    /// Must stay the last variant for `serde(other)`.
    #[default]
    #[serde(other)]
    Okay,
}

impl Rating {
    /// Stable storage and wire representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MustSee => "must_see",
            Self::Great => "great",
            Self::Okay => "okay",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "must_see" => Ok(Self::MustSee),
            "great" => Ok(Self::Great),
            "okay" => Ok(Self::Okay),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown rating '{other}'")),
        }
    }
}

/// A journal entry for one visit to a place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    /// Opaque identifier, compared case-insensitively
    pub id: String,
    /// Owner of the record
    pub user_id: String,
    /// Visited place
    pub place_id: String,
    pub rating: Rating,
    /// Photo URLs, possibly containing placeholder tokens
    pub photo_urls: Vec<String>,
    pub note: String,
    pub tags: Vec<String>,
    /// Trip this visit belongs to, if any
    pub trip_id: Option<String>,
    /// Position inside the trip
    pub sort_order: Option<i32>,
    pub visited_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl Visit {
    /// Create a new locally-authored visit, pending upload
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        place_id: impl Into<String>,
        rating: Rating,
    ) -> Self {
        let now = now_utc();
        Self {
            id: new_record_id(),
            user_id: user_id.into(),
            place_id: place_id.into(),
            rating,
            photo_urls: Vec::new(),
            note: String::new(),
            tags: Vec::new(),
            trip_id: None,
            sort_order: None,
            visited_at: now,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
        }
    }

    /// True while any photo still points at a placeholder token
    #[must_use]
    pub fn has_placeholder_photos(&self) -> bool {
        self.photo_urls.iter().any(|url| is_placeholder_photo(url))
    }

    /// A visit may be pushed once every photo has a real URL
    #[must_use]
    pub fn is_push_ready(&self) -> bool {
        !self.has_placeholder_photos()
    }

    /// Replace placeholder tokens with uploaded URLs.
    ///
    /// Returns true when at least one reference was rewritten.
    pub fn apply_photo_uploads(&mut self, uploads: &HashMap<String, String>) -> bool {
        let mut changed = false;
        for url in &mut self.photo_urls {
            if let Some(uploaded) = uploads.get(url.as_str()) {
                url.clone_from(uploaded);
                changed = true;
            }
        }
        changed
    }
}

impl SyncEntity for Visit {
    const KIND: EntityKind = EntityKind::Visit;

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
