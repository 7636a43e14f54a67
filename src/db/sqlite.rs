use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tracing;

use super::DatabaseError;

/// How long a connection waits on another writer before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a SQLite connection to the given path and run migrations.
///
/// If the file pre-exists it is integrity-checked first. An unreadable or
/// failing file surfaces as `DatabaseError::Corrupt` so the caller can run
/// recovery.
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let pre_existing = path.exists();
    let conn = Connection::open(path)?;
    configure_pragmas(&conn).map_err(classify_open_error)?;
    if pre_existing {
        integrity_check(&conn)?;
    }
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn).map_err(classify_open_error)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    // WAL keeps concurrent readers unblocked while a writer is in progress.
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)
}

/// Run SQLite's integrity check on an opened connection.
pub fn integrity_check(conn: &Connection) -> Result<(), DatabaseError> {
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(classify_open_error)?;
    if verdict != "ok" {
        return Err(DatabaseError::Corrupt { reason: verdict });
    }
    Ok(())
}

/// SQLite reports an unreadable file lazily, on the first real statement.
/// Fold those codes into `Corrupt` so recovery treats them like a failed
/// integrity check.
fn classify_open_error(e: rusqlite::Error) -> DatabaseError {
    if let rusqlite::Error::SqliteFailure(ref err, ref message) = e {
        if err.code == ErrorCode::NotADatabase || err.code == ErrorCode::DatabaseCorrupt {
            return DatabaseError::Corrupt {
                reason: message.clone().unwrap_or_else(|| err.to_string()),
            };
        }
    }
    DatabaseError::Sqlite(e)
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        include_str!("../../resources/migrations/001_operations.sql"),
    )];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}
