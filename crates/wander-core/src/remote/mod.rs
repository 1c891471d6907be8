//! Remote backend boundary.
//!
//! The sync engine talks to the server through [`RemoteBackend`], a
//! collection-oriented interface with upsert, filtered delete and filtered
//! select. [`RestBackend`] implements it over a PostgREST-style HTTP API.

mod rest;
pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

pub use rest::RestBackend;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote API error: {message} ({status})")]
    Api { status: u16, message: String },
    #[error("Invalid remote payload: {0}")]
    Decode(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Transient failures worth retrying on a later attempt or cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Api { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::Unavailable(_) => true,
            Self::Decode(_) | Self::NotAuthenticated | Self::InvalidConfiguration(_) => false,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Row predicate understood by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFilter {
    Eq { column: String, value: String },
    Gt { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl RemoteFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn gt(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Gt {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `column > timestamp`, encoded as RFC 3339 UTC with microseconds
    pub fn updated_after(column: impl Into<String>, after: DateTime<Utc>) -> Self {
        Self::gt(column, format_timestamp(after))
    }

    pub fn in_set<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::Gt { column, .. } | Self::In { column, .. } => column,
        }
    }

    /// Query-string pair in PostgREST operator syntax
    pub fn to_query_pair(&self) -> (String, String) {
        match self {
            Self::Eq { column, value } => (column.clone(), format!("eq.{value}")),
            Self::Gt { column, value } => (column.clone(), format!("gt.{value}")),
            Self::In { column, values } => {
                let list = values
                    .iter()
                    .map(|value| quote_list_value(value))
                    .collect::<Vec<_>>()
                    .join(",");
                (column.clone(), format!("in.({list})"))
            }
        }
    }
}

/// Filtered, ordered and paged select
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectQuery {
    pub filters: Vec<RemoteFilter>,
    /// Sort keys in priority order, as column and ascending flag
    pub order: Vec<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: RemoteFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    /// Add an ascending sort key after any already present
    pub fn order_ascending(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), true));
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Collection-oriented server API used by the sync engine.
///
/// Records travel as JSON objects; [`wire`] converts them to and from the
/// local models.
///
/// Identifier filters must match without regard to case, as a Postgres
/// `uuid` column does. Retried deletes only know the lowercased id.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert or update one record, returning the stored representation
    /// including the server-assigned `updated_at`.
    async fn upsert(&self, collection: &str, record: Value) -> RemoteResult<Value>;

    /// Delete every record matching the filter
    async fn delete(&self, collection: &str, filter: &RemoteFilter) -> RemoteResult<()>;

    /// Fetch records matching the query
    async fn select(&self, collection: &str, query: &SelectQuery) -> RemoteResult<Vec<Value>>;

    /// Cheap reachability check
    async fn probe(&self) -> RemoteResult<()>;
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn quote_list_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| matches!(c, ',' | '(' | ')' | '"' | '\\') || c.is_whitespace());
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
