//! Attendance ledger.
//!
//! At most one row per (course, roll, day). The day is the calendar date of
//! the detection in the institution's UTC offset, while timestamps are
//! stored in UTC. Same-day duplicates are resolved by the table's primary
//! key, never by a read-then-write check: a first detection inserts, a
//! later one only replaces the row when its confidence is strictly higher.

use crate::db::Database;
use crate::{constraint_code, StoreError};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rollcall_core::{AttendanceRecord, CourseCode, RecordOutcome, RollNumber};
use rusqlite::params;
use serde::Serialize;

/// One roster line of a daily summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub roll: RollNumber,
    pub name: String,
    pub present: bool,
    pub confidence: Option<f32>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Present/absent roster for one course and day.
#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub course: CourseCode,
    pub date: NaiveDate,
    pub rows: Vec<SummaryRow>,
    pub present: usize,
    pub total: usize,
    /// `present / total`, 0.0 for an empty roster.
    pub rate: f32,
}

#[derive(Clone)]
pub struct AttendanceLedger {
    db: Database,
    offset: FixedOffset,
}

impl AttendanceLedger {
    pub(crate) fn new(db: Database, offset: FixedOffset) -> Self {
        Self { db, offset }
    }

    /// Institutional calendar date of a UTC instant.
    pub fn day_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.offset).date_naive()
    }

    /// Record a detection, idempotent per institutional day.
    pub fn record(
        &self,
        course: &CourseCode,
        roll: &RollNumber,
        timestamp: DateTime<Utc>,
        confidence: f32,
    ) -> Result<RecordOutcome, StoreError> {
        if !confidence.is_finite() {
            return Err(StoreError::InvalidInput(format!(
                "confidence must be finite, got {confidence}"
            )));
        }
        let day = self.day_of(timestamp);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO attendance (course, roll, day, recorded_at, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (course, roll, day) DO NOTHING",
            params![course.as_str(), roll.as_str(), day, timestamp, confidence],
        );
        let inserted = match inserted {
            Ok(n) => n,
            Err(e) if constraint_code(&e) == Some(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => {
                return Err(StoreError::NotFound {
                    course: course.clone(),
                    roll: roll.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = if inserted == 1 {
            RecordOutcome::Inserted
        } else {
            let updated = tx.execute(
                "UPDATE attendance SET recorded_at = ?4, confidence = ?5
                  WHERE course = ?1 AND roll = ?2 AND day = ?3 AND confidence < ?5",
                params![course.as_str(), roll.as_str(), day, timestamp, confidence],
            )?;
            if updated == 1 {
                RecordOutcome::Updated
            } else {
                RecordOutcome::Unchanged
            }
        };
        tx.commit()?;

        tracing::info!(course = %course, roll = %roll, %day, confidence, ?outcome, "attendance recorded");
        Ok(outcome)
    }

    /// Records with `from <= day <= to`, ordered by day then roll number.
    pub fn query(
        &self,
        course: &CourseCode,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT roll, day, recorded_at, confidence FROM attendance
              WHERE course = ?1 AND day BETWEEN ?2 AND ?3
              ORDER BY day, roll",
        )?;
        let rows = stmt
            .query_map(params![course.as_str(), from, to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, NaiveDate>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(roll, date, timestamp, confidence)| {
                Ok(AttendanceRecord {
                    roll: RollNumber::parse(&roll).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    course: course.clone(),
                    date,
                    timestamp,
                    confidence: confidence as f32,
                })
            })
            .collect()
    }

    /// Roster of a course for one day: every active student plus any
    /// deactivated student who was present that day.
    pub fn summary(&self, course: &CourseCode, date: NaiveDate) -> Result<DailySummary, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT s.roll, s.name, a.confidence, a.recorded_at
               FROM students s
               LEFT JOIN attendance a
                 ON a.course = s.course AND a.roll = s.roll AND a.day = ?2
              WHERE s.course = ?1 AND (s.active = 1 OR a.roll IS NOT NULL)
              ORDER BY s.roll",
        )?;
        let raw = stmt
            .query_map(params![course.as_str(), date], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<DateTime<Utc>>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let rows = raw
            .into_iter()
            .map(|(roll, name, confidence, timestamp)| {
                Ok(SummaryRow {
                    roll: RollNumber::parse(&roll).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    name,
                    present: confidence.is_some(),
                    confidence: confidence.map(|c| c as f32),
                    timestamp,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let total = rows.len();
        let present = rows.iter().filter(|r| r.present).count();
        let rate = if total > 0 {
            present as f32 / total as f32
        } else {
            0.0
        };

        Ok(DailySummary {
            course: course.clone(),
            date,
            rows,
            present,
            total,
            rate,
        })
    }

    /// Correction flow: remove one day's record. Returns whether a row existed.
    pub fn retract(
        &self,
        course: &CourseCode,
        roll: &RollNumber,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM attendance WHERE course = ?1 AND roll = ?2 AND day = ?3",
            params![course.as_str(), roll.as_str(), date],
        )?;
        if removed > 0 {
            tracing::warn!(course = %course, roll = %roll, %date, "attendance retracted");
        }
        Ok(removed > 0)
    }

    /// Administrative purge of every record strictly before `date`.
    pub fn purge_before(&self, course: &CourseCode, date: NaiveDate) -> Result<usize, StoreError> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM attendance WHERE course = ?1 AND day < ?2",
            params![course.as_str(), date],
        )?;
        tracing::warn!(course = %course, before = %date, removed, "attendance purged");
        Ok(removed)
    }
}
