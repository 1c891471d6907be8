//! Upload of dirty local records

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::SyncContext;
use crate::db::{RecordFilter, RecordStore, StatusChange, WriteBatch};
use crate::error::{Error, Result};
use crate::models::{EntityKind, Place, SyncEntity, SyncStatus, Trip, Visit};
use crate::remote::wire::{updated_at_of, WireRecord};
use crate::remote::RemoteBackend;
use crate::util::normalize_id;

/// Counts for one family's push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    /// Not push-ready yet, left `pending`
    pub skipped: usize,
}

/// Upsert one record, returning the server-assigned `updated_at` when present
async fn upload<T: WireRecord + SyncEntity>(
    remote: &dyn RemoteBackend,
    record: &T,
) -> Result<Option<DateTime<Utc>>> {
    let response = remote
        .upsert(T::KIND.collection(), record.to_wire()?)
        .await?;
    Ok(updated_at_of(&response))
}

fn stage_result<T: SyncEntity>(
    batch: &mut WriteBatch,
    report: &mut PushReport,
    record: &T,
    result: Result<Option<DateTime<Utc>>>,
) {
    match result {
        Ok(server_updated_at) => {
            report.pushed += 1;
            batch.set_status(StatusChange::synced_after_push(
                T::KIND,
                record.id(),
                record.updated_at(),
                server_updated_at,
            ));
        }
        Err(e) => {
            report.failed += 1;
            tracing::warn!(
                kind = %T::KIND,
                id = %record.id(),
                retryable = e.is_retryable(),
                "Push failed: {e}"
            );
            batch.set_status(StatusChange::set(T::KIND, record.id(), SyncStatus::Failed));
        }
    }
}

pub(crate) async fn push_trips(ctx: &SyncContext) -> Result<PushReport> {
    let trips = RecordStore::<Trip>::fetch(ctx.store.as_ref(), &RecordFilter::Dirty).await?;
    let mut report = PushReport::default();
    if trips.is_empty() {
        return Ok(report);
    }

    let mut batch = WriteBatch::default();
    for trip in &trips {
        let result = upload(ctx.remote.as_ref(), trip).await;
        stage_result(&mut batch, &mut report, trip, result);
    }
    ctx.store.apply(batch).await?;

    tracing::debug!(pushed = report.pushed, failed = report.failed, "Pushed trips");
    Ok(report)
}

/// Whether a visit may keep its trip reference on upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TripLink {
    Keep,
    Drop,
}

/// Dependency bookkeeping shared by all visits in one push
struct VisitDependencies {
    places: HashMap<String, Place>,
    uploaded_places: HashSet<String>,
    trips: HashMap<String, TripLink>,
}

pub(crate) async fn push_visits(ctx: &SyncContext) -> Result<PushReport> {
    let visits = RecordStore::<Visit>::fetch(ctx.store.as_ref(), &RecordFilter::Dirty).await?;
    let mut report = PushReport::default();
    if visits.is_empty() {
        return Ok(report);
    }

    let place_ids: Vec<String> = visits
        .iter()
        .map(|visit| normalize_id(&visit.place_id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let mut deps = VisitDependencies {
        places: ctx
            .store
            .fetch_places(&place_ids)
            .await?
            .into_iter()
            .map(|place| (normalize_id(&place.id), place))
            .collect(),
        uploaded_places: HashSet::new(),
        trips: HashMap::new(),
    };

    let mut batch = WriteBatch::default();
    for visit in &visits {
        if !visit.is_push_ready() {
            tracing::debug!(visit_id = %visit.id, "Visit has photos still uploading, leaving pending");
            report.skipped += 1;
            continue;
        }
        let result = push_visit(ctx, visit, &mut deps, &mut batch).await;
        stage_result(&mut batch, &mut report, visit, result);
    }
    ctx.store.apply(batch).await?;

    tracing::debug!(
        pushed = report.pushed,
        failed = report.failed,
        skipped = report.skipped,
        "Pushed visits"
    );
    Ok(report)
}

async fn push_visit(
    ctx: &SyncContext,
    visit: &Visit,
    deps: &mut VisitDependencies,
    batch: &mut WriteBatch,
) -> Result<Option<DateTime<Utc>>> {
    let place_key = normalize_id(&visit.place_id);
    if !deps.uploaded_places.contains(&place_key) {
        let place = deps
            .places
            .get(&place_key)
            .ok_or_else(|| Error::MissingDependency {
                kind: EntityKind::Place,
                id: visit.place_id.clone(),
            })?;
        ctx.remote
            .upsert(EntityKind::Place.collection(), place.to_wire()?)
            .await?;
        deps.uploaded_places.insert(place_key);
    }

    let mut payload = visit.clone();
    if let Some(trip_id) = &visit.trip_id {
        let trip_key = normalize_id(trip_id);
        let link = match deps.trips.get(&trip_key) {
            Some(link) => *link,
            None => {
                let link = ensure_trip_uploaded(ctx, trip_id, batch).await;
                deps.trips.insert(trip_key, link);
                link
            }
        };
        if link == TripLink::Drop {
            tracing::warn!(
                visit_id = %visit.id,
                trip_id = %trip_id,
                "Uploading visit without its trip reference"
            );
            payload.trip_id = None;
            payload.sort_order = None;
        }
    }

    upload(ctx.remote.as_ref(), &payload).await
}

/// Make sure the referenced trip exists remotely, pushing it if it is dirty
async fn ensure_trip_uploaded(ctx: &SyncContext, trip_id: &str, batch: &mut WriteBatch) -> TripLink {
    let trips = match RecordStore::<Trip>::fetch(
        ctx.store.as_ref(),
        &RecordFilter::Id(trip_id.to_string()),
    )
    .await
    {
        Ok(trips) => trips,
        Err(e) => {
            tracing::warn!(trip_id = %trip_id, "Failed to load trip for visit push: {e}");
            return TripLink::Drop;
        }
    };
    let Some(trip) = trips.into_iter().max_by_key(|trip| trip.updated_at) else {
        return TripLink::Drop;
    };
    if !trip.sync_status.is_dirty() {
        return TripLink::Keep;
    }

    let mut report = PushReport::default();
    let result = upload(ctx.remote.as_ref(), &trip).await;
    let link = if result.is_ok() {
        TripLink::Keep
    } else {
        TripLink::Drop
    };
    stage_result(batch, &mut report, &trip, result);
    link
}
