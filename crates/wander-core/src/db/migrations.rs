//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_STATEMENTS).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_STATEMENTS).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: journal tables. Timestamps are Unix microseconds.
const V1_STATEMENTS: [&str; 9] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS places (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        address TEXT,
        category TEXT
    )",
    "CREATE TABLE IF NOT EXISTS trips (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        cover_photo_url TEXT,
        start_date TEXT,
        end_date TEXT,
        collaborator_ids TEXT NOT NULL DEFAULT '[]',
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'pending'
    )",
    "CREATE TABLE IF NOT EXISTS visits (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        place_id TEXT NOT NULL,
        rating TEXT NOT NULL,
        photo_urls TEXT NOT NULL DEFAULT '[]',
        note TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT '[]',
        trip_id TEXT,
        sort_order INTEGER,
        visited_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'pending'
    )",
    "CREATE INDEX IF NOT EXISTS idx_visits_status ON visits(sync_status)",
    "CREATE INDEX IF NOT EXISTS idx_visits_updated ON visits(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_trips_status ON trips(sync_status)",
    "CREATE INDEX IF NOT EXISTS idx_trips_updated ON trips(updated_at)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: case-insensitive identifier lookups
const V2_STATEMENTS: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_visits_id_lower ON visits(lower(id))",
    "CREATE INDEX IF NOT EXISTS idx_trips_id_lower ON trips(lower(id))",
    "CREATE INDEX IF NOT EXISTS idx_places_id_lower ON places(lower(id))",
    "INSERT INTO schema_version (version) VALUES (2)",
];

async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (current {CURRENT_VERSION})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tables_exist() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in ["visits", "trips", "places"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?",
                    [table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            assert_eq!(row.get::<i64>(0).unwrap(), 1, "missing table {table}");
        }
    }
}
