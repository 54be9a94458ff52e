use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest roll number accepted at registration.
const ROLL_NUMBER_MAX_DIGITS: usize = 16;

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// L2-normalized copy of the vector.
    ///
    /// Returns `None` for a zero vector or one containing NaN/inf, which
    /// have no direction and cannot take part in cosine comparison.
    pub fn normalized(&self) -> Option<Vec<f32>> {
        if self.values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        Some(self.values.iter().map(|x| x / norm).collect())
    }

    /// Little-endian f32 encoding used for the `students.embedding` blob.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`to_le_bytes`](Self::to_le_bytes).
    /// Returns `None` when the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8], model_version: impl Into<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values, model_version))
    }
}

/// Course code, e.g. "AI". Partitions students and the vector index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseCode(String);

impl CourseCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CourseCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid roll number {0:?}: expected 1-{ROLL_NUMBER_MAX_DIGITS} ASCII digits")]
pub struct InvalidRollNumber(pub String);

/// Student roll number: a fixed-width numeric string, unique within a course.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RollNumber(String);

impl RollNumber {
    pub fn parse(roll: &str) -> Result<Self, InvalidRollNumber> {
        let valid = !roll.is_empty()
            && roll.len() <= ROLL_NUMBER_MAX_DIGITS
            && roll.bytes().all(|b| b.is_ascii_digit());
        if valid {
            Ok(Self(roll.to_string()))
        } else {
            Err(InvalidRollNumber(roll.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RollNumber {
    type Error = InvalidRollNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RollNumber> for String {
    fn from(roll: RollNumber) -> Self {
        roll.0
    }
}

impl fmt::Display for RollNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A course from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub code: CourseCode,
    pub name: String,
}

/// An enrolled student. Never physically deleted; `active = false`
/// excludes it from index builds while keeping ledger rows joinable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub course: CourseCode,
    pub roll: RollNumber,
    pub name: String,
    pub embedding: Embedding,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One face found in an uploaded photo by the embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    /// Detector confidence for the face itself, not an identity score.
    #[serde(default = "default_detection_score")]
    pub score: f32,
}

fn default_detection_score() -> f32 {
    1.0
}

/// A day's attendance for one student in one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub roll: RollNumber,
    pub course: CourseCode,
    /// Calendar date in the institution's time zone.
    pub date: NaiveDate,
    /// UTC instant of the detection that produced the stored confidence.
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

/// Effect of a ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// First detection of the day.
    Inserted,
    /// A higher-confidence detection replaced the day's row.
    Updated,
    /// The day's row already had an equal or higher confidence.
    Unchanged,
}

/// One scored index hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub roll: RollNumber,
    pub similarity: f32,
}

/// What the engine did with one detected face.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MatchAction {
    Recorded { outcome: RecordOutcome },
    /// Best candidate below threshold, or none at all.
    Unrecognized,
    /// Several candidates within the ambiguity margin; nothing recorded.
    Ambiguous { candidates: Vec<Candidate> },
    Failed { error: String },
}

/// Per-face result of processing a photo.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    /// Position of the face in the provider's detection list.
    pub face: usize,
    pub roll: Option<RollNumber>,
    /// Similarity of the best candidate (0.0 when none).
    pub confidence: f32,
    /// Detector confidence that this region is a face at all.
    pub detection_score: f32,
    #[serde(flatten)]
    pub action: MatchAction,
}

impl MatchResult {
    pub fn is_recorded(&self) -> bool {
        matches!(self.action, MatchAction::Recorded { .. })
    }
}
