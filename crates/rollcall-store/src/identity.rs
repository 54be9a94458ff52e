//! Identity store: enrolled students and their embeddings.
//!
//! Source of truth for the vector index. Students are never physically
//! deleted; deactivation keeps the row so ledger entries stay joinable.

use crate::db::Database;
use crate::{constraint_code, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{CourseCode, Embedding, RollNumber, Student};
use rusqlite::{params, OptionalExtension, Row};

const STUDENT_COLUMNS: &str =
    "course, roll, name, embedding, model_version, active, registered_at, updated_at";

/// Registration payload.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub course: CourseCode,
    pub roll: RollNumber,
    pub name: String,
    pub embedding: Embedding,
}

/// Row as read from SQLite, before blob decoding.
struct RawStudent {
    course: String,
    roll: String,
    name: String,
    embedding: Vec<u8>,
    model_version: String,
    active: bool,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawStudent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            course: row.get(0)?,
            roll: row.get(1)?,
            name: row.get(2)?,
            embedding: row.get(3)?,
            model_version: row.get(4)?,
            active: row.get(5)?,
            registered_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_student(self) -> Result<Student, StoreError> {
        let roll = RollNumber::parse(&self.roll)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let embedding = Embedding::from_le_bytes(&self.embedding, self.model_version)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "embedding blob of {} bytes for student {roll} in course {}",
                    self.embedding.len(),
                    self.course
                ))
            })?;
        Ok(Student {
            course: CourseCode::new(self.course),
            roll,
            name: self.name,
            embedding,
            active: self.active,
            registered_at: self.registered_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct IdentityStore {
    db: Database,
}

impl IdentityStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new student. Fails with `DuplicateIdentity` if the roll
    /// number is already taken in the course, including by a deactivated
    /// student.
    pub fn register(&self, new: &NewStudent) -> Result<Student, StoreError> {
        validate_name(&new.name)?;
        let now = Utc::now();

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO students (course, roll, name, embedding, model_version, active, registered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![
                new.course.as_str(),
                new.roll.as_str(),
                new.name,
                new.embedding.to_le_bytes(),
                new.embedding.model_version,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if constraint_code(&e) == Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
                return Err(StoreError::DuplicateIdentity {
                    course: new.course.clone(),
                    roll: new.roll.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        tracing::info!(course = %new.course, roll = %new.roll, "student registered");
        Ok(Student {
            course: new.course.clone(),
            roll: new.roll.clone(),
            name: new.name.clone(),
            embedding: new.embedding.clone(),
            active: true,
            registered_at: now,
            updated_at: now,
        })
    }

    /// Explicit overwrite of an existing student's name and embedding.
    /// Reactivates a deactivated student.
    pub fn reregister(&self, new: &NewStudent) -> Result<Student, StoreError> {
        validate_name(&new.name)?;
        let now = Utc::now();

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE students
                SET name = ?3, embedding = ?4, model_version = ?5, active = 1, updated_at = ?6
              WHERE course = ?1 AND roll = ?2",
            params![
                new.course.as_str(),
                new.roll.as_str(),
                new.name,
                new.embedding.to_le_bytes(),
                new.embedding.model_version,
                now,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                course: new.course.clone(),
                roll: new.roll.clone(),
            });
        }
        let student = fetch(&tx, &new.course, &new.roll)?.ok_or_else(|| StoreError::NotFound {
            course: new.course.clone(),
            roll: new.roll.clone(),
        })?;
        tx.commit()?;

        tracing::info!(course = %new.course, roll = %new.roll, "student re-registered");
        Ok(student)
    }

    /// Fetch one student, active or not.
    pub fn get(&self, course: &CourseCode, roll: &RollNumber) -> Result<Student, StoreError> {
        let conn = self.db.lock();
        fetch(&conn, course, roll)?.ok_or_else(|| StoreError::NotFound {
            course: course.clone(),
            roll: roll.clone(),
        })
    }

    /// Active students of a course, ordered by roll number.
    pub fn list(&self, course: &CourseCode) -> Result<Vec<Student>, StoreError> {
        self.select(course, true)
    }

    /// All students of a course including deactivated ones.
    pub fn list_all(&self, course: &CourseCode) -> Result<Vec<Student>, StoreError> {
        self.select(course, false)
    }

    /// Soft delete. Returns whether the student was active before.
    pub fn deactivate(&self, course: &CourseCode, roll: &RollNumber) -> Result<bool, StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let active: Option<bool> = tx
            .query_row(
                "SELECT active FROM students WHERE course = ?1 AND roll = ?2",
                params![course.as_str(), roll.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(active) = active else {
            return Err(StoreError::NotFound {
                course: course.clone(),
                roll: roll.clone(),
            });
        };
        if active {
            tx.execute(
                "UPDATE students SET active = 0, updated_at = ?3 WHERE course = ?1 AND roll = ?2",
                params![course.as_str(), roll.as_str(), Utc::now()],
            )?;
        }
        tx.commit()?;

        if active {
            tracing::info!(course = %course, roll = %roll, "student deactivated");
        }
        Ok(active)
    }

    fn select(&self, course: &CourseCode, active_only: bool) -> Result<Vec<Student>, StoreError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {STUDENT_COLUMNS} FROM students
              WHERE course = ?1 AND (active = 1 OR ?2 = 0)
              ORDER BY roll"
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params![course.as_str(), active_only], RawStudent::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawStudent::into_student).collect()
    }
}

fn fetch(
    conn: &rusqlite::Connection,
    course: &CourseCode,
    roll: &RollNumber,
) -> Result<Option<Student>, StoreError> {
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE course = ?1 AND roll = ?2");
    conn.query_row(&sql, params![course.as_str(), roll.as_str()], RawStudent::from_row)
        .optional()?
        .map(RawStudent::into_student)
        .transpose()
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput("student name is empty".into()));
    }
    Ok(())
}
