//! Server row formats and their conversion to local models.
//!
//! Decoding is lenient: nulls become empty values, the legacy single
//! `photo_url` column is folded into `photo_urls`, and timestamps are
//! accepted with or without an explicit offset.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{RemoteError, RemoteResult};
use crate::models::{Place, Rating, SyncStatus, Trip, Visit};
use crate::util::truncate_to_micros;

/// Models that travel to and from the backend as JSON rows
pub trait WireRecord: Sized {
    type Row: Serialize + DeserializeOwned;

    fn to_row(&self) -> Self::Row;

    fn from_row(row: Self::Row) -> Self;

    fn to_wire(&self) -> RemoteResult<Value> {
        serde_json::to_value(self.to_row()).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    /// Decode a server row; synced records come back with status `synced`
    fn from_wire(value: Value) -> RemoteResult<Self> {
        serde_json::from_value::<Self::Row>(value)
            .map(Self::from_row)
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRow {
    pub id: String,
    pub user_id: String,
    pub place_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rating: Rating,
    #[serde(default, deserialize_with = "null_as_default")]
    pub photo_urls: Vec<String>,
    /// Single-photo column written by older clients
    #[serde(default, skip_serializing)]
    pub photo_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub note: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i32>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub visited_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Assigned by the server
    #[serde(deserialize_with = "timestamp", skip_serializing)]
    pub updated_at: DateTime<Utc>,
}

impl WireRecord for Visit {
    type Row = VisitRow;

    fn to_row(&self) -> VisitRow {
        VisitRow {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            place_id: self.place_id.clone(),
            rating: self.rating,
            photo_urls: self.photo_urls.clone(),
            photo_url: None,
            note: self.note.clone(),
            tags: self.tags.clone(),
            trip_id: self.trip_id.clone(),
            sort_order: self.sort_order,
            visited_at: Some(self.visited_at),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn from_row(row: VisitRow) -> Self {
        let mut photo_urls = row.photo_urls;
        if photo_urls.is_empty() {
            photo_urls.extend(
                row.photo_url
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty()),
            );
        }
        Self {
            id: row.id,
            user_id: row.user_id,
            place_id: row.place_id,
            rating: row.rating,
            photo_urls,
            note: row.note,
            tags: row.tags,
            trip_id: row.trip_id,
            sort_order: row.sort_order,
            visited_at: row.visited_at.unwrap_or(row.created_at),
            created_at: row.created_at,
            updated_at: row.updated_at,
            sync_status: SyncStatus::Synced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_photo_url: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(
        default,
        alias = "collaborators",
        deserialize_with = "null_as_default"
    )]
    pub collaborator_ids: Vec<String>,
    pub user_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "timestamp", skip_serializing)]
    pub updated_at: DateTime<Utc>,
}

impl WireRecord for Trip {
    type Row = TripRow;

    fn to_row(&self) -> TripRow {
        TripRow {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            cover_photo_url: self.cover_photo_url.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            collaborator_ids: self.collaborator_ids.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn from_row(row: TripRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            cover_photo_url: row.cover_photo_url,
            start_date: row.start_date,
            end_date: row.end_date,
            collaborator_ids: row.collaborator_ids,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sync_status: SyncStatus::Synced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRow {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl WireRecord for Place {
    type Row = PlaceRow;

    fn to_row(&self) -> PlaceRow {
        PlaceRow {
            id: self.id.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address.clone(),
            category: self.category.clone(),
        }
    }

    fn from_row(row: PlaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            latitude: row.latitude,
            longitude: row.longitude,
            address: row.address,
            category: row.category,
        }
    }
}

/// Read `updated_at` out of a returned row without decoding the rest
pub fn updated_at_of(row: &Value) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

/// Parse RFC 3339 or Postgres-style timestamps; values without an offset are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(truncate_to_micros(parsed.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(truncate_to_micros(parsed.with_timezone(&Utc)));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(truncate_to_micros(parsed.and_utc()));
        }
    }
    None
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn visit_decodes_with_nulls_and_legacy_photo() {
        let visit = Visit::from_wire(json!({
            "id": "LOG-1",
            "user_id": "user-1",
            "place_id": "place-1",
            "rating": "life_changing",
            "photo_urls": null,
            "photo_url": "https://cdn.example.com/a.jpg",
            "note": null,
            "tags": null,
            "created_at": "2025-03-01T12:00:00Z",
            "updated_at": "2025-03-01 12:05:00.123456+00"
        }))
        .unwrap();

        assert_eq!(visit.id, "LOG-1");
        assert_eq!(visit.rating, Rating::Okay);
        assert_eq!(visit.photo_urls, vec!["https://cdn.example.com/a.jpg"]);
        assert_eq!(visit.note, "");
        assert!(visit.tags.is_empty());
        assert_eq!(visit.visited_at, visit.created_at);
        assert_eq!(visit.sync_status, SyncStatus::Synced);
        assert_eq!(
            visit.updated_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap()
                + chrono::Duration::microseconds(123_456)
        );
    }

    #[test]
    fn visit_encoding_omits_server_fields() {
        let visit = Visit::new("user-1", "place-1", Rating::Great);
        let value = visit.to_wire().unwrap();
        assert!(value.get("updated_at").is_none());
        assert!(value.get("photo_url").is_none());
        assert_eq!(value["rating"], "great");
        assert_eq!(value["id"], visit.id.as_str());
    }

    #[test]
    fn trip_accepts_collaborators_alias() {
        let trip = Trip::from_wire(json!({
            "id": "trip-1",
            "name": "Kyoto",
            "start_date": "2025-04-01",
            "collaborators": ["user-2"],
            "user_id": "user-1",
            "created_at": "2025-03-01T12:00:00",
            "updated_at": "2025-03-01T12:00:00+09:00"
        }))
        .unwrap();

        assert_eq!(trip.collaborator_ids, vec!["user-2"]);
        assert_eq!(trip.start_date, NaiveDate::from_ymd_opt(2025, 4, 1));
        assert_eq!(
            trip.updated_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn invalid_timestamp_is_decode_error() {
        let result = Trip::from_wire(json!({
            "id": "trip-1",
            "name": "Kyoto",
            "user_id": "user-1",
            "created_at": "yesterday",
            "updated_at": "2025-03-01T12:00:00Z"
        }));
        assert!(matches!(result, Err(RemoteError::Decode(_))));
    }

    #[test]
    fn place_accepts_short_coordinates() {
        let place = Place::from_wire(json!({
            "id": "place-1",
            "name": "Shrine",
            "lat": 34.9,
            "lng": 135.7
        }))
        .unwrap();
        assert!((place.latitude - 34.9).abs() < f64::EPSILON);
        assert!((place.longitude - 135.7).abs() < f64::EPSILON);
    }

    #[test]
    fn updated_at_of_reads_returned_row() {
        let row = json!({"id": "x", "updated_at": "2025-03-01T12:00:00Z"});
        assert_eq!(
            updated_at_of(&row),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(updated_at_of(&json!({"id": "x"})), None);
    }
}
