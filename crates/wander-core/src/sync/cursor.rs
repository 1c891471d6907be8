//! Per-family pull cursors

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::models::EntityKind;
use crate::remote::format_timestamp;
use crate::remote::wire::parse_timestamp;

/// Highest `updated_at` pulled so far for each family.
///
/// A missing cursor means the next pull fetches everything.
#[derive(Clone)]
pub struct CursorStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CursorStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(kind: EntityKind) -> String {
        format!("sync_cursor.{}", kind.collection())
    }

    pub fn get(&self, kind: EntityKind) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.kv.get(&Self::key(kind))? else {
            return Ok(None);
        };
        let parsed = parse_timestamp(&raw);
        if parsed.is_none() {
            // A full pull is always safe
            tracing::warn!(%kind, value = %raw, "Ignoring unreadable sync cursor");
        }
        Ok(parsed)
    }

    /// Move the cursor forward to `seen`; never moves it backward.
    ///
    /// Returns true when the stored value changed.
    pub fn advance(&self, kind: EntityKind, seen: DateTime<Utc>) -> Result<bool> {
        if self.get(kind)?.is_some_and(|current| current >= seen) {
            return Ok(false);
        }
        self.kv
            .set(&Self::key(kind), Some(&format_timestamp(seen)))?;
        Ok(true)
    }

    pub fn reset(&self, kind: EntityKind) -> Result<()> {
        self.kv.set(&Self::key(kind), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use chrono::TimeZone;

    fn cursors() -> (CursorStore, Arc<MemoryKeyValueStore>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        (CursorStore::new(kv.clone()), kv)
    }

    #[test]
    fn cursor_starts_empty_and_only_moves_forward() {
        let (cursors, _) = cursors();
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        assert_eq!(cursors.get(EntityKind::Visit).unwrap(), None);
        assert!(cursors.advance(EntityKind::Visit, late).unwrap());
        assert!(!cursors.advance(EntityKind::Visit, early).unwrap());
        assert!(!cursors.advance(EntityKind::Visit, late).unwrap());
        assert_eq!(cursors.get(EntityKind::Visit).unwrap(), Some(late));

        // Families are independent
        assert_eq!(cursors.get(EntityKind::Trip).unwrap(), None);
    }

    #[test]
    fn cursor_reset_forces_full_pull() {
        let (cursors, kv) = cursors();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        cursors.advance(EntityKind::Trip, at).unwrap();
        assert!(kv.get("sync_cursor.trips").unwrap().is_some());

        cursors.reset(EntityKind::Trip).unwrap();
        assert_eq!(cursors.get(EntityKind::Trip).unwrap(), None);
    }

    #[test]
    fn unreadable_cursor_is_treated_as_missing() {
        let (cursors, kv) = cursors();
        kv.set("sync_cursor.visits", Some("not a time")).unwrap();
        assert_eq!(cursors.get(EntityKind::Visit).unwrap(), None);
    }
}
