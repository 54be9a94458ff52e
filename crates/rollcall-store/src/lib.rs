//! rollcall-store — durable state for the attendance system.
//!
//! One SQLite database holds the identity store (source of truth for the
//! vector index) and the attendance ledger. Both handles share a single
//! connection; every write runs in its own transaction.

pub mod db;
pub mod identity;
pub mod ledger;

pub use db::Database;
pub use identity::{IdentityStore, NewStudent};
pub use ledger::{AttendanceLedger, DailySummary, SummaryRow};

use rollcall_core::{CourseCode, RollNumber};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student {roll} is already registered in course {course}")]
    DuplicateIdentity { course: CourseCode, roll: RollNumber },
    #[error("student {roll} not found in course {course}")]
    NotFound { course: CourseCode, roll: RollNumber },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Failures of the durability layer itself, as opposed to rejected input.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_))
    }
}

/// Extended SQLite result code of a constraint failure, if that is what `err` is.
pub(crate) fn constraint_code(err: &rusqlite::Error) -> Option<std::os::raw::c_int> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Some(e.extended_code)
        }
        _ => None,
    }
}
