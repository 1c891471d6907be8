//! Local record store for visits, trips and places

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Row, Value};
use tokio::sync::Mutex;

use super::Database;
use crate::error::{Error, Result};
use crate::models::{EntityKind, Place, SyncEntity, SyncStatus, Trip, Visit};
use crate::util::normalize_id;

/// Upper bound on identifiers bound into a single `IN (...)` clause
const MAX_BOUND_IDS: usize = 500;

const VISIT_COLUMNS: &str = "id, user_id, place_id, rating, photo_urls, note, tags, trip_id, \
     sort_order, visited_at, created_at, updated_at, sync_status";
const TRIP_COLUMNS: &str = "id, name, description, cover_photo_url, start_date, end_date, \
     collaborator_ids, user_id, created_at, updated_at, sync_status";
const PLACE_COLUMNS: &str = "id, name, latitude, longitude, address, category";

/// Which local records a fetch returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Every record of the family
    All,
    /// Records whose identifier matches, ignoring case
    Id(String),
    /// Records whose identifier is in the set, ignoring case
    Ids(Vec<String>),
    /// Records with status `pending` or `failed`
    Dirty,
    /// Records with exactly this status
    Status(SyncStatus),
    /// Records updated strictly after the timestamp
    UpdatedAfter(DateTime<Utc>),
}

/// A sync status write, optionally guarded on the record being unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub kind: EntityKind,
    /// Exact stored identifier
    pub id: String,
    pub status: SyncStatus,
    /// Only apply when the stored `updated_at` still equals this value
    pub expected_updated_at: Option<DateTime<Utc>>,
    /// Replacement `updated_at`, e.g. the server-assigned timestamp
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    /// Mark a pushed record synced unless it was edited while the push was in flight.
    pub fn synced_after_push(
        kind: EntityKind,
        id: impl Into<String>,
        pushed_updated_at: DateTime<Utc>,
        server_updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            status: SyncStatus::Synced,
            expected_updated_at: Some(pushed_updated_at),
            updated_at: server_updated_at,
        }
    }

    /// Unconditionally set a status, keeping `updated_at`.
    pub fn set(kind: EntityKind, id: impl Into<String>, status: SyncStatus) -> Self {
        Self {
            kind,
            id: id.into(),
            status,
            expected_updated_at: None,
            updated_at: None,
        }
    }
}

/// Mutations committed together in one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub places: Vec<Place>,
    pub trips: Vec<Trip>,
    pub visits: Vec<Visit>,
    /// Exact stored identifiers
    pub deleted_trip_ids: Vec<String>,
    /// Exact stored identifiers
    pub deleted_visit_ids: Vec<String>,
    pub status_changes: Vec<StatusChange>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
            && self.trips.is_empty()
            && self.visits.is_empty()
            && self.deleted_trip_ids.is_empty()
            && self.deleted_visit_ids.is_empty()
            && self.status_changes.is_empty()
    }

    /// Stage an insert-or-replace of a record
    pub fn upsert<T: StoredRecord>(&mut self, record: T) {
        T::staged_upserts(self).push(record);
    }

    /// Stage removal of the record stored under exactly this identifier
    pub fn delete<T: StoredRecord>(&mut self, id: impl Into<String>) {
        T::staged_deletions(self).push(id.into());
    }

    pub fn set_status(&mut self, change: StatusChange) {
        self.status_changes.push(change);
    }
}

/// Sync entities the local store persists
pub trait StoredRecord: SyncEntity {
    fn staged_upserts(batch: &mut WriteBatch) -> &mut Vec<Self>;
    fn staged_deletions(batch: &mut WriteBatch) -> &mut Vec<String>;
}

impl StoredRecord for Visit {
    fn staged_upserts(batch: &mut WriteBatch) -> &mut Vec<Self> {
        &mut batch.visits
    }

    fn staged_deletions(batch: &mut WriteBatch) -> &mut Vec<String> {
        &mut batch.deleted_visit_ids
    }
}

impl StoredRecord for Trip {
    fn staged_upserts(batch: &mut WriteBatch) -> &mut Vec<Self> {
        &mut batch.trips
    }

    fn staged_deletions(batch: &mut WriteBatch) -> &mut Vec<String> {
        &mut batch.deleted_trip_ids
    }
}

/// Read access to one entity family
#[async_trait]
pub trait RecordStore<T: StoredRecord>: Send + Sync {
    /// Fetch records matching the filter, oldest update first
    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<T>>;
}

/// Local persistence used by the sync engine
#[async_trait]
pub trait LocalStore: RecordStore<Visit> + RecordStore<Trip> {
    /// Places whose identifier is in the set, ignoring case
    async fn fetch_places(&self, ids: &[String]) -> Result<Vec<Place>>;

    /// Number of visits and trips not yet synced
    async fn count_dirty(&self) -> Result<usize>;

    /// Commit every mutation in the batch atomically
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}

/// libSQL implementation of `LocalStore`
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Mutex<Database>>,
}

impl LibSqlStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open a store at the given filesystem path, creating parent directories.
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(Database::open(&db_path).await?))
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?))
    }

    /// Fetch visits matching the filter
    pub async fn fetch_visits(&self, filter: &RecordFilter) -> Result<Vec<Visit>> {
        self.query_records("visits", VISIT_COLUMNS, filter, parse_visit)
            .await
    }

    /// Fetch trips matching the filter
    pub async fn fetch_trips(&self, filter: &RecordFilter) -> Result<Vec<Trip>> {
        self.query_records("trips", TRIP_COLUMNS, filter, parse_trip)
            .await
    }

    async fn query_records<T>(
        &self,
        table: &str,
        columns: &str,
        filter: &RecordFilter,
        parse: fn(&Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut records = Vec::new();
        if let RecordFilter::Ids(ids) = filter {
            for chunk in ids.chunks(MAX_BOUND_IDS) {
                let (clause, params) = ids_clause(chunk);
                let sql = format!("SELECT {columns} FROM {table}{clause} ORDER BY updated_at, id");
                records.extend(collect_rows(conn, &sql, params, parse).await?);
            }
            return Ok(records);
        }

        let (clause, params) = filter_clause(filter);
        let sql = format!("SELECT {columns} FROM {table}{clause} ORDER BY updated_at, id");
        records.extend(collect_rows(conn, &sql, params, parse).await?);
        Ok(records)
    }
}

#[async_trait]
impl RecordStore<Visit> for LibSqlStore {
    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<Visit>> {
        self.fetch_visits(filter).await
    }
}

#[async_trait]
impl RecordStore<Trip> for LibSqlStore {
    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<Trip>> {
        self.fetch_trips(filter).await
    }
}

#[async_trait]
impl LocalStore for LibSqlStore {
    async fn fetch_places(&self, ids: &[String]) -> Result<Vec<Place>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut places = Vec::new();
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let (clause, params) = ids_clause(chunk);
            let sql = format!("SELECT {PLACE_COLUMNS} FROM places{clause} ORDER BY id");
            places.extend(collect_rows(conn, &sql, params, parse_place).await?);
        }
        Ok(places)
    }

    async fn count_dirty(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT (SELECT COUNT(*) FROM visits WHERE sync_status != 'synced')
                      + (SELECT COUNT(*) FROM trips WHERE sync_status != 'synced')",
                (),
            )
            .await?;

        let count: i64 = if let Some(row) = rows.next().await? {
            row.get(0)?
        } else {
            0
        };
        usize::try_from(count).map_err(|_| Error::Database(format!("invalid count {count}")))
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN TRANSACTION", ()).await?;
        if let Err(e) = write_batch(conn, &batch).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }
        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        tracing::debug!(
            visits = batch.visits.len(),
            trips = batch.trips.len(),
            places = batch.places.len(),
            deletions = batch.deleted_visit_ids.len() + batch.deleted_trip_ids.len(),
            status_changes = batch.status_changes.len(),
            "Committed local write batch"
        );
        Ok(())
    }
}

async fn write_batch(conn: &Connection, batch: &WriteBatch) -> Result<()> {
    for id in &batch.deleted_visit_ids {
        conn.execute("DELETE FROM visits WHERE id = ?", [id.as_str()])
            .await?;
    }
    for id in &batch.deleted_trip_ids {
        conn.execute("DELETE FROM trips WHERE id = ?", [id.as_str()])
            .await?;
    }

    for place in &batch.places {
        conn.execute(
            "INSERT INTO places (id, name, latitude, longitude, address, category)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                address = excluded.address,
                category = excluded.category",
            vec![
                Value::Text(place.id.clone()),
                Value::Text(place.name.clone()),
                Value::Real(place.latitude),
                Value::Real(place.longitude),
                optional_text(place.address.as_deref()),
                optional_text(place.category.as_deref()),
            ],
        )
        .await?;
    }

    for trip in &batch.trips {
        conn.execute(
            "INSERT INTO trips (id, name, description, cover_photo_url, start_date, end_date,
                                collaborator_ids, user_id, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                cover_photo_url = excluded.cover_photo_url,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                collaborator_ids = excluded.collaborator_ids,
                user_id = excluded.user_id,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                sync_status = excluded.sync_status",
            vec![
                Value::Text(trip.id.clone()),
                Value::Text(trip.name.clone()),
                optional_text(trip.description.as_deref()),
                optional_text(trip.cover_photo_url.as_deref()),
                optional_date(trip.start_date),
                optional_date(trip.end_date),
                Value::Text(serde_json::to_string(&trip.collaborator_ids)?),
                Value::Text(trip.user_id.clone()),
                Value::Integer(to_micros(trip.created_at)),
                Value::Integer(to_micros(trip.updated_at)),
                Value::Text(trip.sync_status.as_str().to_string()),
            ],
        )
        .await?;
    }

    for visit in &batch.visits {
        conn.execute(
            "INSERT INTO visits (id, user_id, place_id, rating, photo_urls, note, tags, trip_id,
                                 sort_order, visited_at, created_at, updated_at, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                place_id = excluded.place_id,
                rating = excluded.rating,
                photo_urls = excluded.photo_urls,
                note = excluded.note,
                tags = excluded.tags,
                trip_id = excluded.trip_id,
                sort_order = excluded.sort_order,
                visited_at = excluded.visited_at,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                sync_status = excluded.sync_status",
            vec![
                Value::Text(visit.id.clone()),
                Value::Text(visit.user_id.clone()),
                Value::Text(visit.place_id.clone()),
                Value::Text(visit.rating.as_str().to_string()),
                Value::Text(serde_json::to_string(&visit.photo_urls)?),
                Value::Text(visit.note.clone()),
                Value::Text(serde_json::to_string(&visit.tags)?),
                optional_text(visit.trip_id.as_deref()),
                visit
                    .sort_order
                    .map_or(Value::Null, |order| Value::Integer(i64::from(order))),
                Value::Integer(to_micros(visit.visited_at)),
                Value::Integer(to_micros(visit.created_at)),
                Value::Integer(to_micros(visit.updated_at)),
                Value::Text(visit.sync_status.as_str().to_string()),
            ],
        )
        .await?;
    }

    for change in &batch.status_changes {
        let table = match change.kind {
            EntityKind::Visit => "visits",
            EntityKind::Trip => "trips",
            EntityKind::Place => {
                return Err(Error::InvalidInput(
                    "places do not carry a sync status".to_string(),
                ))
            }
        };
        let sql = format!(
            "UPDATE {table}
             SET sync_status = ?1, updated_at = COALESCE(?2, updated_at)
             WHERE id = ?3 AND (?4 IS NULL OR updated_at = ?4)"
        );
        let changed = conn
            .execute(
                &sql,
                vec![
                    Value::Text(change.status.as_str().to_string()),
                    change
                        .updated_at
                        .map_or(Value::Null, |at| Value::Integer(to_micros(at))),
                    Value::Text(change.id.clone()),
                    change
                        .expected_updated_at
                        .map_or(Value::Null, |at| Value::Integer(to_micros(at))),
                ],
            )
            .await?;
        if changed == 0 {
            tracing::debug!(
                kind = %change.kind,
                id = %change.id,
                status = %change.status,
                "Skipped status change for a record edited or removed meanwhile"
            );
        }
    }

    Ok(())
}

async fn collect_rows<T>(
    conn: &Connection,
    sql: &str,
    params: Vec<Value>,
    parse: fn(&Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut rows = conn.query(sql, params).await?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().await? {
        records.push(parse(&row)?);
    }
    Ok(records)
}

fn filter_clause(filter: &RecordFilter) -> (String, Vec<Value>) {
    match filter {
        RecordFilter::All => (String::new(), Vec::new()),
        RecordFilter::Id(id) => (
            " WHERE lower(id) = ?".to_string(),
            vec![Value::Text(normalize_id(id))],
        ),
        RecordFilter::Ids(ids) => ids_clause(ids),
        RecordFilter::Dirty => (" WHERE sync_status != 'synced'".to_string(), Vec::new()),
        RecordFilter::Status(status) => (
            " WHERE sync_status = ?".to_string(),
            vec![Value::Text(status.as_str().to_string())],
        ),
        RecordFilter::UpdatedAfter(after) => (
            " WHERE updated_at > ?".to_string(),
            vec![Value::Integer(to_micros(*after))],
        ),
    }
}

fn ids_clause(ids: &[String]) -> (String, Vec<Value>) {
    if ids.is_empty() {
        return (" WHERE 0".to_string(), Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    (
        format!(" WHERE lower(id) IN ({placeholders})"),
        ids.iter().map(|id| Value::Text(normalize_id(id))).collect(),
    )
}

fn parse_visit(row: &Row) -> Result<Visit> {
    Ok(Visit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        place_id: row.get(2)?,
        rating: row.get::<String>(3)?.parse().unwrap_or_default(),
        photo_urls: serde_json::from_str(&row.get::<String>(4)?)?,
        note: row.get(5)?,
        tags: serde_json::from_str(&row.get::<String>(6)?)?,
        trip_id: row.get(7)?,
        sort_order: row.get(8)?,
        visited_at: from_micros(row.get(9)?)?,
        created_at: from_micros(row.get(10)?)?,
        updated_at: from_micros(row.get(11)?)?,
        sync_status: parse_status(&row.get::<String>(12)?)?,
    })
}

fn parse_trip(row: &Row) -> Result<Trip> {
    Ok(Trip {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        cover_photo_url: row.get(3)?,
        start_date: parse_date(row.get(4)?)?,
        end_date: parse_date(row.get(5)?)?,
        collaborator_ids: serde_json::from_str(&row.get::<String>(6)?)?,
        user_id: row.get(7)?,
        created_at: from_micros(row.get(8)?)?,
        updated_at: from_micros(row.get(9)?)?,
        sync_status: parse_status(&row.get::<String>(10)?)?,
    })
}

fn parse_place(row: &Row) -> Result<Place> {
    Ok(Place {
        id: row.get(0)?,
        name: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        address: row.get(4)?,
        category: row.get(5)?,
    })
}

fn parse_status(value: &str) -> Result<SyncStatus> {
    value.parse().map_err(Error::InvalidData)
}

fn parse_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|e| Error::InvalidData(format!("invalid date '{raw}': {e}")))
        })
        .transpose()
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

fn optional_date(value: Option<NaiveDate>) -> Value {
    value.map_or(Value::Null, |date| {
        Value::Text(date.format("%Y-%m-%d").to_string())
    })
}

fn to_micros(value: DateTime<Utc>) -> i64 {
    value.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| Error::InvalidData(format!("timestamp out of range: {value}")))
}
