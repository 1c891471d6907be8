//! Folding pulled records into the local store.
//!
//! Rules, in order, for each remote record:
//! 1. identifier listed as pending deletion: skip
//! 2. no local record: insert as `synced`
//! 3. local record is dirty (`pending` or `failed`): skip
//! 4. local record is `synced`: overwrite only if the remote `updated_at` is
//!    strictly newer
//!
//! Small batches look records up one at a time. Larger batches load the
//! whole family once and also collapse local rows whose identifiers differ
//! only by case, keeping the most recently updated one.

use std::collections::{BTreeSet, HashMap};

use crate::db::{RecordFilter, RecordStore, StoredRecord, WriteBatch};
use crate::error::Result;
use crate::models::SyncStatus;
use crate::util::normalize_id;

/// What happened to a pulled batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_pending_deletion: usize,
    pub skipped_dirty: usize,
    pub unchanged: usize,
    /// Local case-duplicates removed by the full path
    pub deduplicated: usize,
}

impl MergeOutcome {
    pub const fn changed(&self) -> usize {
        self.inserted + self.updated + self.deduplicated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Insert,
    Overwrite,
    SkipPendingDeletion,
    SkipDirty,
    SkipNotNewer,
}

fn decide<T: StoredRecord>(local: Option<&T>, remote: &T, pending_deletion: bool) -> Decision {
    if pending_deletion {
        return Decision::SkipPendingDeletion;
    }
    match local {
        None => Decision::Insert,
        Some(local) if local.sync_status().is_dirty() => Decision::SkipDirty,
        Some(local) if remote.updated_at() > local.updated_at() => Decision::Overwrite,
        Some(_) => Decision::SkipNotNewer,
    }
}

/// Stage the effect of `remote` onto `batch`.
///
/// `pending_deletions` holds normalized identifiers.
pub async fn merge_remote<T, S>(
    store: &S,
    remote: Vec<T>,
    pending_deletions: &BTreeSet<String>,
    incremental_threshold: usize,
    batch: &mut WriteBatch,
) -> Result<MergeOutcome>
where
    T: StoredRecord,
    S: RecordStore<T> + ?Sized,
{
    if remote.is_empty() {
        return Ok(MergeOutcome::default());
    }

    let mut outcome = MergeOutcome::default();
    let mut locals = if remote.len() <= incremental_threshold {
        load_matching(store, &remote).await?
    } else {
        load_all_deduplicated(store, batch, &mut outcome).await?
    };

    for mut record in remote {
        let key = normalize_id(record.id());
        let local = locals.get(&key);
        match decide(local, &record, pending_deletions.contains(&key)) {
            Decision::SkipPendingDeletion => {
                tracing::debug!(kind = %T::KIND, id = %record.id(), "Skipping record pending deletion");
                outcome.skipped_pending_deletion += 1;
            }
            Decision::SkipDirty => outcome.skipped_dirty += 1,
            Decision::SkipNotNewer => outcome.unchanged += 1,
            Decision::Insert => {
                record.set_sync_status(SyncStatus::Synced);
                outcome.inserted += 1;
                batch.upsert(record.clone());
                locals.insert(key, record);
            }
            Decision::Overwrite => {
                if let Some(local) = local {
                    // Keep the stored spelling so the upsert replaces the same row
                    record.set_id(local.id().to_string());
                }
                record.set_sync_status(SyncStatus::Synced);
                outcome.updated += 1;
                batch.upsert(record.clone());
                locals.insert(key, record);
            }
        }
    }

    Ok(outcome)
}

/// Incremental path: one identifier lookup per remote record
async fn load_matching<T, S>(store: &S, remote: &[T]) -> Result<HashMap<String, T>>
where
    T: StoredRecord,
    S: RecordStore<T> + ?Sized,
{
    let mut locals = HashMap::with_capacity(remote.len());
    for record in remote {
        let key = normalize_id(record.id());
        if locals.contains_key(&key) {
            continue;
        }
        let matches = store.fetch(&RecordFilter::Id(record.id().to_string())).await?;
        if let Some(local) = matches.into_iter().max_by_key(|local| local.updated_at()) {
            locals.insert(key, local);
        }
    }
    Ok(locals)
}

/// Full path: whole family in one read, case-duplicates collapsed
async fn load_all_deduplicated<T, S>(
    store: &S,
    batch: &mut WriteBatch,
    outcome: &mut MergeOutcome,
) -> Result<HashMap<String, T>>
where
    T: StoredRecord,
    S: RecordStore<T> + ?Sized,
{
    let all = store.fetch(&RecordFilter::All).await?;
    let mut locals: HashMap<String, T> = HashMap::with_capacity(all.len());

    for record in all {
        let key = normalize_id(record.id());
        let Some(existing) = locals.remove(&key) else {
            locals.insert(key, record);
            continue;
        };

        let (keep, discard) = if record.updated_at() > existing.updated_at() {
            (record, existing)
        } else {
            (existing, record)
        };
        tracing::info!(
            kind = %T::KIND,
            kept = %keep.id(),
            discarded = %discard.id(),
            "Removing local duplicate with case-mismatched identifier"
        );
        batch.delete::<T>(discard.id().to_string());
        outcome.deduplicated += 1;
        locals.insert(key, keep);
    }

    Ok(locals)
}
