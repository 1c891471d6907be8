//! wander-core - offline-first sync engine for the Wander travel journal
//!
//! Local edits land in a libSQL store first and are reconciled with a REST
//! backend by [`SyncEngine`]. Deletes are tracked in a ledger outside the
//! store so a pull can never bring a deleted record back.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod models;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityKind, Place, Rating, SyncStatus, Trip, Visit};
pub use state::{SyncSnapshot, SyncState};
pub use sync::{SyncEngine, SyncOutcome, SyncReport};
