pub mod sqlite;

pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Database file failed integrity check: {reason}")]
    Corrupt { reason: String },

    #[error("Database unrecoverable after corruption recovery: {reason}")]
    Unrecoverable { reason: String },

    #[error("Database busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Store is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
