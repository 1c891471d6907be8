//! Local persistence for Wander

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{
    LibSqlStore, LocalStore, RecordFilter, RecordStore, StatusChange, StoredRecord, WriteBatch,
};
