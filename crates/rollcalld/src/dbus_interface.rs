use crate::engine::{EngineError, MatchEngine, StudentInfo};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceService {
    engine: Arc<MatchEngine>,
}

impl AttendanceService {
    pub fn new(engine: Arc<MatchEngine>) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a student from a photo containing exactly one face.
    async fn register(
        &self,
        course: &str,
        roll: &str,
        name: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(course, roll, bytes = image.len(), "register requested");
        let student = self
            .engine
            .register(course, roll, name, image)
            .await
            .map_err(to_fdo)?;
        to_json(&StudentInfo::from(student))
    }

    /// Overwrite an existing student's name and embedding.
    async fn reregister(
        &self,
        course: &str,
        roll: &str,
        name: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(course, roll, "reregister requested");
        let student = self
            .engine
            .reregister(course, roll, name, image)
            .await
            .map_err(to_fdo)?;
        to_json(&StudentInfo::from(student))
    }

    /// Soft-delete a student. Returns false if already inactive.
    async fn deactivate(&self, course: &str, roll: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(course, roll, "deactivate requested");
        self.engine.deactivate(course, roll).await.map_err(to_fdo)
    }

    /// Match every face in a photo and record attendance.
    async fn recognize(&self, course: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(course, bytes = image.len(), "recognize requested");
        let report = self.engine.process_photo(course, image).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Attendance records for an inclusive `YYYY-MM-DD` date range.
    async fn attendance(&self, course: &str, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let from = parse_date(from)?;
        let to = parse_date(to)?;
        let records = self.engine.attendance(course, from, to).await.map_err(to_fdo)?;
        to_json(&records)
    }

    /// Present/absent roster for one day; an empty date means today.
    async fn summary(&self, course: &str, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            self.engine.today()
        } else {
            parse_date(date)?
        };
        let summary = self.engine.summary(course, date).await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// All students of a course, including deactivated ones.
    async fn list_students(&self, course: &str) -> zbus::fdo::Result<String> {
        let students = self.engine.list_students(course).await.map_err(to_fdo)?;
        to_json(&students)
    }

    /// One student, active or not.
    async fn get_student(&self, course: &str, roll: &str) -> zbus::fdo::Result<String> {
        let student = self.engine.student(course, roll).await.map_err(to_fdo)?;
        to_json(&student)
    }

    /// Correction flow: remove one day's attendance for a student.
    async fn retract(&self, course: &str, roll: &str, date: &str) -> zbus::fdo::Result<bool> {
        let date = parse_date(date)?;
        tracing::warn!(course, roll, %date, "retract requested");
        self.engine.retract(course, roll, date).await.map_err(to_fdo)
    }

    /// Administrative purge of records dated before `before`.
    async fn purge(&self, course: &str, before: &str) -> zbus::fdo::Result<u32> {
        let before = parse_date(before)?;
        tracing::warn!(course, %before, "purge requested");
        let removed = self.engine.purge_before(course, before).await.map_err(to_fdo)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Rebuild a course index from the identity store.
    async fn rebuild(&self, course: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(course, "rebuild requested");
        let entries = self.engine.rebuild(course).await.map_err(to_fdo)?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.engine.status().to_string())
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    let mut msg = format!("{}: {e}", e.kind());
    if e.is_retryable() {
        msg.push_str(" (retryable)");
    }
    if e.is_caller_error() {
        zbus::fdo::Error::InvalidArgs(msg)
    } else {
        tracing::error!(error = %e, "request failed");
        zbus::fdo::Error::Failed(msg)
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encode: {e}")))
}

fn parse_date(s: &str) -> zbus::fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("InvalidInput: date {s:?}: {e}")))
}
