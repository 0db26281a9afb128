//! Versioned schema migrations embedded in the binary.
//!
//! Applied versions are tracked in `schema_migrations`; `up` applies every
//! pending step in order, `down` reverts the latest applied step.

use rusqlite::{params, Connection};

use crate::StorageResult;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_instruments",
        up: "CREATE TABLE instruments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL,
                isin TEXT NOT NULL,
                figi TEXT NOT NULL,
                ticker TEXT NOT NULL,
                class_code TEXT NOT NULL,
                name TEXT NOT NULL,
                lot INTEGER NOT NULL,
                available_api INTEGER NOT NULL,
                for_quals INTEGER NOT NULL,
                first_candle_date INTEGER NOT NULL,
                UNIQUE (uid, isin, figi, ticker)
            );",
        down: "DROP TABLE instruments;",
    },
    Migration {
        version: 2,
        name: "create_candles",
        up: "CREATE TABLE candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument_id INTEGER NOT NULL REFERENCES instruments (id),
                ts INTEGER NOT NULL,
                interval TEXT NOT NULL,
                open_units INTEGER NOT NULL,
                open_nano INTEGER NOT NULL,
                high_units INTEGER NOT NULL,
                high_nano INTEGER NOT NULL,
                low_units INTEGER NOT NULL,
                low_nano INTEGER NOT NULL,
                close_units INTEGER NOT NULL,
                close_nano INTEGER NOT NULL,
                volume INTEGER NOT NULL,
                UNIQUE (instrument_id, ts, interval)
            );",
        down: "DROP TABLE candles;",
    },
    Migration {
        version: 3,
        name: "create_orders",
        up: "CREATE TABLE orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER,
                completion_time INTEGER,
                order_id TEXT NOT NULL,
                order_id_ref TEXT,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                price_units INTEGER NOT NULL,
                price_nano INTEGER NOT NULL,
                lots_requested INTEGER NOT NULL,
                lots_executed INTEGER NOT NULL,
                trader_id TEXT NOT NULL,
                instrument_id INTEGER NOT NULL REFERENCES instruments (id),
                UNIQUE (instrument_id, order_id)
            );
            CREATE INDEX idx_orders_trader ON orders (trader_id, instrument_id);",
        down: "DROP INDEX idx_orders_trader; DROP TABLE orders;",
    },
];

fn ensure_tracking_table(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Versions already applied, ascending.
pub fn applied_versions(conn: &Connection) -> StorageResult<Vec<i64>> {
    ensure_tracking_table(conn)?;
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

/// Apply every pending migration. Returns the versions applied.
pub fn up(conn: &Connection) -> StorageResult<Vec<i64>> {
    let applied = applied_versions(conn)?;
    let mut newly_applied = Vec::new();
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        newly_applied.push(migration.version);
    }
    Ok(newly_applied)
}

/// Revert the most recently applied migration, if any.
pub fn down(conn: &Connection) -> StorageResult<Option<i64>> {
    let applied = applied_versions(conn)?;
    let Some(latest) = applied.last().copied() else {
        return Ok(None);
    };
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == latest)
        .expect("applied migration missing from the embedded list");
    conn.execute_batch(migration.down)?;
    conn.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![latest],
    )?;
    Ok(Some(latest))
}

/// Per-migration applied/pending report.
pub fn status(conn: &Connection) -> StorageResult<Vec<(i64, &'static str, bool)>> {
    let applied = applied_versions(conn)?;
    Ok(MIGRATIONS
        .iter()
        .map(|m| (m.version, m.name, applied.contains(&m.version)))
        .collect())
}
