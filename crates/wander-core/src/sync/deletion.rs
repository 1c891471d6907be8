//! Local-first deletes backed by the pending-deletion ledger.
//!
//! A delete lands in the ledger before anything else happens, then the local
//! row goes, then the server is asked. The ledger entry is only cleared once
//! the server confirms, so a pull in between cannot bring the record back.

use std::collections::BTreeSet;

use super::SyncContext;
use crate::db::{LocalStore, RecordFilter, RecordStore, StoredRecord, WriteBatch};
use crate::error::Result;
use crate::models::EntityKind;
use crate::remote::{RemoteFilter, RemoteResult};
use crate::util::normalize_id;

/// Outcome of retrying unconfirmed deletes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub confirmed: usize,
    pub remaining: usize,
}

impl DeletionReport {
    fn merge(&mut self, other: Self) {
        self.confirmed += other.confirmed;
        self.remaining += other.remaining;
    }
}

fn id_filter(ids: &BTreeSet<String>) -> RemoteFilter {
    match ids.iter().next() {
        Some(id) if ids.len() == 1 => RemoteFilter::eq("id", id.clone()),
        _ => RemoteFilter::in_set("id", ids.iter().cloned()),
    }
}

/// Delete `ids` locally and remotely.
///
/// Returns whether the server confirmed. A `false` result leaves the
/// identifiers in the ledger for the next round. When `attempt_remote` is
/// false only the local half runs.
pub(crate) async fn delete_records<T>(
    ctx: &SyncContext,
    ids: &[String],
    attempt_remote: bool,
) -> Result<bool>
where
    T: StoredRecord,
    dyn LocalStore: RecordStore<T>,
{
    let requested: BTreeSet<String> = ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    let ids: BTreeSet<String> = requested.iter().map(|id| normalize_id(id)).collect();
    if ids.is_empty() {
        return Ok(true);
    }

    ctx.ledger.add(T::KIND, &ids)?;

    let filter = match ids.iter().next() {
        Some(id) if ids.len() == 1 => RecordFilter::Id(id.clone()),
        _ => RecordFilter::Ids(ids.iter().cloned().collect()),
    };
    let locals = RecordStore::<T>::fetch(ctx.store.as_ref(), &filter).await?;
    if !locals.is_empty() {
        let mut batch = WriteBatch::default();
        for local in &locals {
            batch.delete::<T>(local.id().to_string());
        }
        ctx.store.apply(batch).await?;
    }
    tracing::info!(
        kind = %T::KIND,
        requested = ids.len(),
        removed = locals.len(),
        "Deleted records locally"
    );
    if !attempt_remote {
        return Ok(false);
    }

    // Every known spelling, for servers whose id columns compare by case
    let mut spellings = ids.clone();
    spellings.extend(requested);
    spellings.extend(locals.iter().map(|local| local.id().to_string()));
    match delete_remote_with_retry(ctx, T::KIND, &spellings).await {
        Ok(()) => {
            ctx.ledger.remove(T::KIND, &ids)?;
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(
                kind = %T::KIND,
                count = ids.len(),
                "Remote delete failed, will retry next sync: {e}"
            );
            Ok(false)
        }
    }
}

async fn delete_remote_with_retry(
    ctx: &SyncContext,
    kind: EntityKind,
    ids: &BTreeSet<String>,
) -> RemoteResult<()> {
    let filter = id_filter(ids);
    let attempts = ctx.config.delete_retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        match ctx.remote.delete(kind.collection(), &filter).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts && e.is_retryable() => {
                tracing::debug!(kind = %kind, attempt, "Remote delete failed, retrying: {e}");
                tokio::time::sleep(ctx.config.delete_retry_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One attempt per family at every delete the server has not confirmed
pub(crate) async fn retry_pending_deletions(ctx: &SyncContext) -> Result<DeletionReport> {
    let mut report = DeletionReport::default();
    for kind in [EntityKind::Trip, EntityKind::Visit] {
        report.merge(retry_family(ctx, kind).await?);
    }
    Ok(report)
}

async fn retry_family(ctx: &SyncContext, kind: EntityKind) -> Result<DeletionReport> {
    let ids = ctx.ledger.entries(kind)?;
    if ids.is_empty() {
        return Ok(DeletionReport::default());
    }

    match ctx.remote.delete(kind.collection(), &id_filter(&ids)).await {
        Ok(()) => {
            ctx.ledger.remove(kind, &ids)?;
            tracing::info!(kind = %kind, count = ids.len(), "Confirmed pending deletions");
            Ok(DeletionReport {
                confirmed: ids.len(),
                remaining: 0,
            })
        }
        Err(e) => {
            tracing::warn!(kind = %kind, count = ids.len(), "Pending deletions still unconfirmed: {e}");
            Ok(DeletionReport {
                confirmed: 0,
                remaining: ids.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Rating, Trip, Visit};
    use crate::sync::testing::MemoryRemote;
    use crate::sync::tests::context;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded_visit(ctx: &SyncContext, id: &str) -> Visit {
        let mut visit = Visit::new("user-1", "place-1", Rating::Okay);
        visit.id = id.to_string();
        let mut batch = WriteBatch::default();
        batch.upsert(visit.clone());
        ctx.store.apply(batch).await.unwrap();
        visit
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn confirmed_delete_clears_the_ledger() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed("visits", json!({"id": "log-1"}));
        let (ctx, store) = context(remote.clone()).await;
        seeded_visit(&ctx, "log-1").await;

        let confirmed = delete_records::<Visit>(&ctx, &["LOG-1".to_string()], true)
            .await
            .unwrap();
        assert!(confirmed);
        assert!(store.fetch_visits(&RecordFilter::All).await.unwrap().is_empty());
        assert!(remote.rows("visits").is_empty());
        assert!(ctx.ledger.entries(EntityKind::Visit).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_delete_is_local_and_remembered() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let (ctx, store) = context(remote.clone()).await;
        seeded_visit(&ctx, "log-2").await;

        let confirmed = delete_records::<Visit>(&ctx, &["log-2".to_string()], true)
            .await
            .unwrap();
        assert!(!confirmed);
        assert!(store.fetch_visits(&RecordFilter::All).await.unwrap().is_empty());
        assert!(ctx.ledger.contains(EntityKind::Visit, "log-2").unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_are_retried_in_place() {
        let remote = Arc::new(MemoryRemote::new());
        let (ctx, _) = context(remote.clone()).await;
        remote.fail_next_deletes(2);

        let confirmed = delete_records::<Trip>(&ctx, &["trip-1".to_string()], true)
            .await
            .unwrap();
        assert!(confirmed);
        assert_eq!(
            remote.calls().iter().filter(|c| *c == "delete:trips").count(),
            3
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_delete_uses_one_remote_call() {
        let remote = Arc::new(MemoryRemote::new());
        for id in ["a", "b", "c"] {
            remote.seed("visits", json!({ "id": id }));
        }
        let (ctx, store) = context(remote.clone()).await;
        for id in ["a", "b", "c"] {
            seeded_visit(&ctx, id).await;
        }

        let ids = vec!["a".to_string(), "B".to_string()];
        assert!(delete_records::<Visit>(&ctx, &ids, true).await.unwrap());
        assert_eq!(remote.calls(), vec!["delete:visits".to_string()]);
        let left = store.fetch_visits(&RecordFilter::All).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "c");
        assert_eq!(remote.rows("visits").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_sends_original_spellings_to_exact_id_columns() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_case_sensitive_ids(true);
        remote.seed("visits", json!({"id": "Log-7"}));
        remote.seed("trips", json!({"id": "Trip-X"}));
        let (ctx, _) = context(remote.clone()).await;
        seeded_visit(&ctx, "Log-7").await;

        // Spelling known only from the local row
        assert!(delete_records::<Visit>(&ctx, &["log-7".to_string()], true)
            .await
            .unwrap());
        assert!(remote.rows("visits").is_empty());

        // Spelling known only from the caller
        assert!(delete_records::<Trip>(&ctx, &["Trip-X".to_string()], true)
            .await
            .unwrap());
        assert!(remote.rows("trips").is_empty());
        assert!(ctx.ledger.entries(EntityKind::Trip).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_confirms_ledger_entries() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed("trips", json!({"id": "trip-9"}));
        let (ctx, _) = context(remote.clone()).await;
        ctx.ledger.add(EntityKind::Trip, ["trip-9"]).unwrap();
        ctx.ledger.add(EntityKind::Visit, ["log-4"]).unwrap();

        remote.set_offline(true);
        let report = retry_pending_deletions(&ctx).await.unwrap();
        assert_eq!(report, DeletionReport { confirmed: 0, remaining: 2 });

        remote.set_offline(false);
        let report = retry_pending_deletions(&ctx).await.unwrap();
        assert_eq!(report, DeletionReport { confirmed: 2, remaining: 0 });
        assert!(remote.rows("trips").is_empty());
        assert!(ctx.ledger.entries(EntityKind::Trip).unwrap().is_empty());
    }
}
