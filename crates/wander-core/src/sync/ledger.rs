//! Pending-deletion ledger

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::models::EntityKind;
use crate::util::normalize_id;

/// Identifiers deleted locally whose remote delete is not yet confirmed.
///
/// Entries are normalized so lookups ignore case. While an identifier is
/// listed, pulls never insert or update a record with that identifier.
#[derive(Clone)]
pub struct PendingDeletionLedger {
    kv: Arc<dyn KeyValueStore>,
}

impl PendingDeletionLedger {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(kind: EntityKind) -> String {
        format!("pending_deletions.{}", kind.collection())
    }

    pub fn entries(&self, kind: EntityKind) -> Result<BTreeSet<String>> {
        match self.kv.get(&Self::key(kind))? {
            None => Ok(BTreeSet::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::InvalidData(format!("unreadable pending deletions for {kind}: {e}"))
            }),
        }
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self.entries(kind)?.contains(&normalize_id(id)))
    }

    pub fn add<I, S>(&self, kind: EntityKind, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.entries(kind)?;
        let before = entries.len();
        entries.extend(ids.into_iter().map(|id| normalize_id(id.as_ref())));
        if entries.len() == before {
            return Ok(());
        }
        self.store(kind, &entries)
    }

    pub fn remove<I, S>(&self, kind: EntityKind, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.entries(kind)?;
        let before = entries.len();
        for id in ids {
            entries.remove(&normalize_id(id.as_ref()));
        }
        if entries.len() == before {
            return Ok(());
        }
        self.store(kind, &entries)
    }

    fn store(&self, kind: EntityKind, entries: &BTreeSet<String>) -> Result<()> {
        if entries.is_empty() {
            return self.kv.set(&Self::key(kind), None);
        }
        let raw = serde_json::to_string(entries)?;
        self.kv.set(&Self::key(kind), Some(&raw))
    }
}
