//! Durable, self-healing log of stamping operations keyed by fingerprint.
//!
//! The store owns the persisted record set. At most one live row exists per
//! fingerprint: a repeated operation updates that row's timestamp, duplicate
//! flag and reason instead of inserting a second one. Corrupted database
//! files are backed up beside themselves and recreated on open.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::fingerprint;
use crate::db::{self, DatabaseError};
use crate::models::{OperationKey, OperationRecord};

const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Timestamp format written to the `timestamp` column (ISO-8601, sortable).
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Handle to the operation audit database. Explicitly constructed and
/// explicitly closed; call sites receive it by reference, never through a
/// process-global singleton.
pub struct OperationStore {
    conn: Option<Connection>,
}

impl OperationStore {
    /// Open (or create) the audit database at `path`.
    ///
    /// A pre-existing file that fails the integrity check is backed up as
    /// `<name>.corrupted.bak`, deleted and recreated. Recovery runs at most
    /// once per open: if the fresh store also reports corrupt, the host I/O
    /// layer is broken and the error surfaces as `Unrecoverable`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match db::open_database(path) {
            Ok(conn) => conn,
            Err(DatabaseError::Corrupt { reason }) => {
                tracing::warn!(
                    db = %path.display(),
                    %reason,
                    "Audit database failed integrity check, recreating"
                );
                backup_corrupted(path);
                db::open_database(path).map_err(|e| match e {
                    DatabaseError::Corrupt { reason } => DatabaseError::Unrecoverable { reason },
                    other => other,
                })?
            }
            Err(e) => return Err(e),
        };

        harden_permissions(path);

        Ok(Self { conn: Some(conn) })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = db::open_memory_database()?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection, DatabaseError> {
        self.conn.as_ref().ok_or(DatabaseError::Closed)
    }

    /// Look up a prior operation with the same fingerprint.
    ///
    /// Read-only. Returns the most recent matching record verbatim, or `None`.
    /// Query failures degrade to `None` with a warning: a broken audit lookup
    /// must not block the clinical workflow. Calling on a closed store is a
    /// caller bug and fails loudly instead.
    pub fn check_duplicate(
        &self,
        key: &OperationKey,
    ) -> Result<Option<OperationRecord>, DatabaseError> {
        let conn = self.conn()?;
        let fp = fingerprint::compute(key);

        match query_by_fingerprint(conn, &fp) {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(error = %e, "Duplicate check failed, treating operation as new");
                Ok(None)
            }
        }
    }

    /// Persist an operation and return its row id.
    ///
    /// Inserts a brand-new row; when the fingerprint uniqueness constraint
    /// rejects the insert (another writer got there between check and record)
    /// the existing row's timestamp, duplicate flag and reason are updated in
    /// place instead. Transient busy/locked conditions are retried with a
    /// short increasing backoff before surfacing as `Busy`.
    pub fn record_operation(
        &mut self,
        key: &OperationKey,
        is_duplicate: bool,
        reprint_reason: Option<&str>,
        output_location: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        let fp = fingerprint::compute(key);
        let timestamp = Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string();
        let recorded_by = current_user();

        let mut files = key.files.clone();
        files.sort();
        let files_json = serde_json::to_string(&files).expect("file list serializes");
        let file_count = files.len() as i64;

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let inserted = conn.execute(
                "INSERT INTO operations (
                    timestamp, operation_type, time_point, center_code,
                    hospital_number, pdf_files, merge_flag, is_duplicate,
                    reprint_reason, recorded_by, fingerprint, file_count,
                    output_location
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    timestamp,
                    key.kind.as_str(),
                    key.time_point.as_str(),
                    key.center.as_str(),
                    key.hospital_number,
                    files_json,
                    key.merge,
                    is_duplicate,
                    reprint_reason,
                    recorded_by,
                    fp,
                    file_count,
                    output_location,
                ],
            );

            match inserted {
                Ok(_) => return Ok(conn.last_insert_rowid()),
                Err(e) if is_unique_violation(&e) => {
                    // Lost a race with another writer for the same fingerprint.
                    // Last write wins on the metadata.
                    conn.execute(
                        "UPDATE operations
                         SET timestamp = ?1, is_duplicate = 1, reprint_reason = ?2
                         WHERE fingerprint = ?3",
                        params![timestamp, reprint_reason, fp],
                    )?;
                    let id = conn.query_row(
                        "SELECT id FROM operations WHERE fingerprint = ?1",
                        params![fp],
                        |row| row.get(0),
                    )?;
                    return Ok(id);
                }
                Err(e) if is_busy(&e) => {
                    if attempt + 1 == MAX_WRITE_ATTEMPTS {
                        return Err(DatabaseError::Busy {
                            attempts: MAX_WRITE_ATTEMPTS,
                        });
                    }
                    tracing::debug!(attempt, "Audit database locked, retrying");
                    thread::sleep(RETRY_BASE_DELAY * (attempt + 1));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DatabaseError::Busy {
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    /// Release the database handle. Safe to call more than once; any later
    /// operation on this store fails with `DatabaseError::Closed`.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, e)) = conn.close() {
                tracing::warn!(error = %e, "Error closing audit database");
            }
        }
    }
}

impl Drop for OperationStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn query_by_fingerprint(
    conn: &Connection,
    fp: &str,
) -> Result<Option<OperationRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, timestamp, operation_type, time_point, center_code,
                    hospital_number, pdf_files, merge_flag, is_duplicate,
                    reprint_reason, recorded_by, fingerprint, file_count,
                    output_location
             FROM operations
             WHERE fingerprint = ?1
             ORDER BY timestamp DESC
             LIMIT 1",
            params![fp],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, bool>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, Option<String>>(13)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        timestamp,
        kind,
        time_point,
        center,
        hospital_number,
        files_json,
        merge,
        is_duplicate,
        reprint_reason,
        recorded_by,
        fingerprint,
        file_count,
        output_location,
    )) = row
    else {
        return Ok(None);
    };

    let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| DatabaseError::Corrupt {
            reason: format!("unparseable timestamp in operations row {id}: {e}"),
        })?;
    let files: Vec<String> =
        serde_json::from_str(&files_json).map_err(|e| DatabaseError::Corrupt {
            reason: format!("unparseable file list in operations row {id}: {e}"),
        })?;

    Ok(Some(OperationRecord {
        id,
        timestamp,
        kind: kind.parse()?,
        time_point: time_point.parse()?,
        center: center.parse()?,
        hospital_number,
        files,
        merge,
        is_duplicate,
        reprint_reason,
        recorded_by,
        fingerprint,
        file_count,
        output_location,
    }))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}

/// Back up a corrupted database file beside itself and remove the original
/// together with its WAL sidecars. Backup failures are logged, never fatal:
/// recreating the store matters more than preserving the wreckage.
fn backup_corrupted(path: &Path) {
    let backup = path.with_extension("db.corrupted.bak");
    if let Err(e) = std::fs::copy(path, &backup) {
        tracing::warn!(error = %e, "Could not back up corrupted audit database");
    } else {
        tracing::info!(backup = %backup.display(), "Corrupted audit database backed up");
    }

    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(sidecar(path, "-wal"));
    let _ = std::fs::remove_file(sidecar(path, "-shm"));
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Restrict the database file to the current account. Best effort: a failure
/// is logged and the store stays available with default permissions.
#[cfg(unix)]
fn harden_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let result = std::fs::metadata(path).and_then(|meta| {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "Could not restrict audit database permissions");
    }
}

#[cfg(not(unix))]
fn harden_permissions(_path: &Path) {}

/// Best-effort identity of the invoking user.
fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
