//! rollcall-core — per-course face embedding index and match decisions.
//!
//! Embeddings come from an external model behind [`EmbeddingProvider`];
//! this crate owns normalization, the course-partitioned cosine index
//! and the threshold/ambiguity decision.

pub mod courses;
pub mod index;
pub mod matcher;
pub mod provider;
pub mod types;

pub use courses::{CatalogError, CourseCatalog};
pub use index::{CourseIndex, CourseStats, IndexEntry, IndexError, RebuildOutcome, VectorIndex};
pub use matcher::{Decision, Matcher, ThresholdMatcher};
pub use provider::{EmbeddingProvider, ProviderError};
pub use types::{
    AttendanceRecord, Candidate, Course, CourseCode, Detection, Embedding, InvalidRollNumber,
    MatchAction, MatchResult, RecordOutcome, RollNumber, Student,
};
