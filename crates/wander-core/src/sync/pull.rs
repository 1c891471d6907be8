//! Download of remote changes since the last cursor

use std::collections::HashSet;

use serde_json::Value;

use super::merge::{merge_remote, MergeOutcome};
use super::SyncContext;
use crate::db::{LocalStore, RecordStore, StoredRecord, WriteBatch};
use crate::error::Result;
use crate::models::{EntityKind, Place, Trip, Visit};
use crate::remote::wire::WireRecord;
use crate::remote::{RemoteFilter, SelectQuery};
use crate::util::normalize_id;

/// Place identifiers per dependency select
const PLACE_LOOKUP_CHUNK: usize = 200;

/// Counts for one family's pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Remote records decoded
    pub fetched: usize,
    /// Places downloaded because pulled visits referenced them
    pub places_fetched: usize,
    pub merge: MergeOutcome,
}

/// Select every row changed after the cursor, one page at a time
async fn fetch_changed(ctx: &SyncContext, kind: EntityKind) -> Result<Vec<Value>> {
    let page_size = ctx.config.pull_page_size.max(1);
    // `id` breaks timestamp ties so offsets stay stable between pages
    let mut base = SelectQuery::new()
        .order_ascending("updated_at")
        .order_ascending("id")
        .limit(page_size);
    if let Some(cursor) = ctx.cursors.get(kind)? {
        base = base.filter(RemoteFilter::updated_after(
            "updated_at",
            cursor - ctx.config.clock_skew(),
        ));
    } else {
        tracing::debug!(kind = %kind, "No cursor stored, pulling everything");
    }

    let mut rows = Vec::new();
    loop {
        let query = base.clone().offset(rows.len());
        let page = ctx.remote.select(kind.collection(), &query).await?;
        let page_len = page.len();
        rows.extend(page);
        if page_len < page_size {
            break;
        }
    }
    Ok(rows)
}

fn decode_rows<T: WireRecord + StoredRecord>(rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match T::from_wire(row) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(kind = %T::KIND, "Skipping undecodable remote row: {e}");
                None
            }
        })
        .collect()
}

/// Merge decoded records, apply them with `batch`, and advance the cursor
async fn merge_family<T>(
    ctx: &SyncContext,
    records: Vec<T>,
    mut batch: WriteBatch,
    report: &mut PullReport,
) -> Result<()>
where
    T: StoredRecord,
    dyn LocalStore: RecordStore<T>,
{
    let Some(newest) = records.iter().map(|record| record.updated_at()).max() else {
        return Ok(());
    };

    let pending = ctx.ledger.entries(T::KIND)?;
    report.merge = merge_remote(
        ctx.store.as_ref(),
        records,
        &pending,
        ctx.config.incremental_merge_threshold,
        &mut batch,
    )
    .await?;
    ctx.store.apply(batch).await?;
    ctx.cursors.advance(T::KIND, newest)?;

    tracing::debug!(
        kind = %T::KIND,
        fetched = report.fetched,
        inserted = report.merge.inserted,
        updated = report.merge.updated,
        "Pulled changes"
    );
    Ok(())
}

pub(crate) async fn pull_trips(ctx: &SyncContext) -> Result<PullReport> {
    let trips: Vec<Trip> = decode_rows(fetch_changed(ctx, EntityKind::Trip).await?);
    let mut report = PullReport {
        fetched: trips.len(),
        ..PullReport::default()
    };
    merge_family(ctx, trips, WriteBatch::default(), &mut report).await?;
    Ok(report)
}

pub(crate) async fn pull_visits(ctx: &SyncContext) -> Result<PullReport> {
    let visits: Vec<Visit> = decode_rows(fetch_changed(ctx, EntityKind::Visit).await?);
    let mut report = PullReport {
        fetched: visits.len(),
        ..PullReport::default()
    };
    if visits.is_empty() {
        return Ok(report);
    }

    // Places first so the visits never land without their dependency
    let mut batch = WriteBatch::default();
    report.places_fetched = fetch_missing_places(ctx, &visits, &mut batch).await?;
    merge_family(ctx, visits, batch, &mut report).await?;
    Ok(report)
}

/// Download places referenced by pulled visits that are not stored locally
async fn fetch_missing_places(
    ctx: &SyncContext,
    visits: &[Visit],
    batch: &mut WriteBatch,
) -> Result<usize> {
    let referenced: HashSet<String> = visits
        .iter()
        .map(|visit| normalize_id(&visit.place_id))
        .collect();
    let referenced: Vec<String> = referenced.into_iter().collect();
    let known: HashSet<String> = ctx
        .store
        .fetch_places(&referenced)
        .await?
        .iter()
        .map(|place| normalize_id(&place.id))
        .collect();
    let missing: Vec<String> = referenced
        .into_iter()
        .filter(|id| !known.contains(id))
        .collect();

    let mut fetched = 0;
    for chunk in missing.chunks(PLACE_LOOKUP_CHUNK) {
        let query = SelectQuery::new().filter(RemoteFilter::in_set("id", chunk.iter().cloned()));
        let rows = ctx
            .remote
            .select(EntityKind::Place.collection(), &query)
            .await?;
        for row in rows {
            match Place::from_wire(row) {
                Ok(place) => {
                    fetched += 1;
                    batch.places.push(place);
                }
                Err(e) => tracing::warn!("Skipping undecodable place row: {e}"),
            }
        }
    }
    if fetched < missing.len() {
        tracing::warn!(
            missing = missing.len() - fetched,
            "Some visited places are unknown to the server"
        );
    }
    Ok(fetched)
}
