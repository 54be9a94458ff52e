use crate::identity::IdentityStore;
use crate::ledger::AttendanceLedger;
use crate::StoreError;
use chrono::FixedOffset;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS students (
    course        TEXT    NOT NULL,
    roll          TEXT    NOT NULL,
    name          TEXT    NOT NULL,
    embedding     BLOB    NOT NULL,
    model_version TEXT    NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL,
    PRIMARY KEY (course, roll)
);

CREATE TABLE IF NOT EXISTS attendance (
    course      TEXT NOT NULL,
    roll        TEXT NOT NULL,
    day         TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    confidence  REAL NOT NULL,
    PRIMARY KEY (course, roll, day),
    FOREIGN KEY (course, roll) REFERENCES students (course, roll)
);

CREATE INDEX IF NOT EXISTS attendance_by_day ON attendance (course, day);
";

/// Shared SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal = %journal, "opened attendance database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(SCHEMA_V1)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                tracing::info!(version = SCHEMA_VERSION, "initialized database schema");
            }
            SCHEMA_VERSION => {}
            newer => {
                return Err(StoreError::Corrupt(format!(
                    "database schema version {newer} is newer than supported {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn identities(&self) -> IdentityStore {
        IdentityStore::new(self.clone())
    }

    /// Ledger bucketing days in the institution's UTC offset.
    pub fn ledger(&self, institution_offset: FixedOffset) -> AttendanceLedger {
        AttendanceLedger::new(self.clone(), institution_offset)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // An unwinding writer drops its `Transaction`, which rolls back.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}
