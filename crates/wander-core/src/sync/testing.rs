//! In-memory backend used by the sync tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{watch, Notify};

use crate::remote::wire::parse_timestamp;
use crate::remote::{
    format_timestamp, RemoteBackend, RemoteError, RemoteFilter, RemoteResult, SelectQuery,
};
use crate::util::{normalize_id, now_utc};

pub struct MemoryRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    clock: Mutex<DateTime<Utc>>,
    offline: AtomicBool,
    fail_upserts: AtomicBool,
    fail_upsert_ids: Mutex<HashSet<String>>,
    fail_deletes: AtomicUsize,
    fail_selects: AtomicBool,
    selects: AtomicUsize,
    case_sensitive_ids: AtomicBool,
    calls: Mutex<Vec<String>>,
    select_gate: watch::Sender<bool>,
    select_entered: Notify,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        let (select_gate, _) = watch::channel(true);
        Self {
            tables: Mutex::new(HashMap::new()),
            clock: Mutex::new(now_utc()),
            offline: AtomicBool::new(false),
            fail_upserts: AtomicBool::new(false),
            fail_upsert_ids: Mutex::new(HashSet::new()),
            fail_deletes: AtomicUsize::new(0),
            fail_selects: AtomicBool::new(false),
            selects: AtomicUsize::new(0),
            case_sensitive_ids: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            select_gate,
            select_entered: Notify::new(),
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server clock; every write advances it so timestamps are unique
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        *clock = (*clock + Duration::milliseconds(1)).max(now_utc());
        *clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock().unwrap()
    }

    /// Write a row as another device would, keeping its `updated_at`
    pub fn seed(&self, collection: &str, row: Value) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(collection.to_string()).or_default();
        let id = row_id(&row);
        rows.retain(|existing| row_id(existing) != id);
        rows.push(row);
    }

    pub fn rows(&self, collection: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, collection: &str, id: &str) -> Option<Value> {
        let id = normalize_id(id);
        self.rows(collection)
            .into_iter()
            .find(|row| row_id(row) == id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_upserts_for(&self, id: &str) {
        self.fail_upsert_ids
            .lock()
            .unwrap()
            .insert(normalize_id(id));
    }

    /// Fail the next `count` delete calls
    pub fn fail_next_deletes(&self, count: usize) {
        self.fail_deletes.store(count, Ordering::SeqCst);
    }

    /// Compare identifier filters exactly, like a `text` id column
    pub fn set_case_sensitive_ids(&self, exact: bool) {
        self.case_sensitive_ids.store(exact, Ordering::SeqCst);
    }

    fn matches(&self, row: &Value, filter: &RemoteFilter) -> bool {
        matches_filter(row, filter, self.case_sensitive_ids.load(Ordering::SeqCst))
    }

    pub fn fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::SeqCst);
    }

    /// Hold every select until the gate is reopened
    pub fn close_select_gate(&self) {
        self.select_gate.send_replace(false);
    }

    pub fn open_select_gate(&self) {
        self.select_gate.send_replace(true);
    }

    /// Resolves once a select has started
    pub async fn select_entered(&self) {
        self.select_entered.notified().await;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("network unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn upsert(&self, collection: &str, record: Value) -> RemoteResult<Value> {
        let id = row_id(&record);
        self.record(format!("upsert:{collection}:{id}"));
        self.check_online()?;
        if self.fail_upserts.load(Ordering::SeqCst)
            || self.fail_upsert_ids.lock().unwrap().contains(&id)
        {
            return Err(RemoteError::Api {
                status: 500,
                message: "injected upsert failure".to_string(),
            });
        }

        let Value::Object(mut fields) = record else {
            return Err(RemoteError::Api {
                status: 400,
                message: "expected an object".to_string(),
            });
        };
        if collection != "places" {
            fields.insert(
                "updated_at".to_string(),
                Value::String(format_timestamp(self.tick())),
            );
        }
        let stored = Value::Object(fields);

        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(collection.to_string()).or_default();
        rows.retain(|existing| row_id(existing) != id);
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn delete(&self, collection: &str, filter: &RemoteFilter) -> RemoteResult<()> {
        self.record(format!("delete:{collection}"));
        self.check_online()?;
        let remaining = self.fail_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Api {
                status: 503,
                message: "injected delete failure".to_string(),
            });
        }

        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(collection) {
            rows.retain(|row| !self.matches(row, filter));
        }
        Ok(())
    }

    async fn select(&self, collection: &str, query: &SelectQuery) -> RemoteResult<Vec<Value>> {
        self.record(format!("select:{collection}"));
        self.select_entered.notify_one();
        let mut gate = self.select_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.check_online()?;
        if self.fail_selects.load(Ordering::SeqCst) {
            return Err(RemoteError::Api {
                status: 502,
                message: "injected select failure".to_string(),
            });
        }

        let mut rows: Vec<Value> = self
            .rows(collection)
            .into_iter()
            .filter(|row| query.filters.iter().all(|filter| self.matches(row, filter)))
            .collect();
        // Like a real server, ties come back in no particular order
        if self.selects.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            rows.reverse();
        }
        if !query.order.is_empty() {
            rows.sort_by(|a, b| {
                query
                    .order
                    .iter()
                    .map(|(column, ascending)| {
                        let ordering = sort_key(a, column).cmp(&sort_key(b, column));
                        if *ascending {
                            ordering
                        } else {
                            ordering.reverse()
                        }
                    })
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn probe(&self) -> RemoteResult<()> {
        self.record("probe".to_string());
        self.check_online()
    }
}

fn row_id(row: &Value) -> String {
    normalize_id(row.get("id").and_then(Value::as_str).unwrap_or_default())
}

fn column_text(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn sort_key(row: &Value, column: &str) -> (Option<DateTime<Utc>>, Option<String>) {
    let text = column_text(row, column);
    (text.as_deref().and_then(parse_timestamp), text)
}

fn matches_filter(row: &Value, filter: &RemoteFilter, case_sensitive_ids: bool) -> bool {
    // Identifier columns behave like uuid columns unless told otherwise
    let normalize = |column: &str, value: &str| {
        if !case_sensitive_ids && (column == "id" || column.ends_with("_id")) {
            normalize_id(value)
        } else {
            value.to_string()
        }
    };
    let column = filter.column();
    let Some(actual) = column_text(row, column) else {
        return false;
    };
    match filter {
        RemoteFilter::Eq { value, .. } => normalize(column, &actual) == normalize(column, value),
        RemoteFilter::In { values, .. } => values
            .iter()
            .any(|value| normalize(column, value) == normalize(column, &actual)),
        RemoteFilter::Gt { value, .. } => {
            match (parse_timestamp(&actual), parse_timestamp(value)) {
                (Some(actual), Some(bound)) => actual > bound,
                _ => actual > *value,
            }
        }
    }
}
