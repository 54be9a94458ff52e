//! Per-course nearest-neighbour index over enrolled embeddings.
//!
//! Every vector is L2-normalized once, when an [`IndexEntry`] is prepared
//! and when a probe is queried, so similarity is the dot product of unit
//! vectors (cosine similarity, clamped to [-1, 1]).
//!
//! Published state is an immutable map `course -> Arc<CourseIndex>` behind
//! an [`ArcSwap`]. Queries load the current map without locking and search
//! it; writers serialize on a mutex, build a fresh `CourseIndex` and publish
//! a new map with a single pointer store. A reader therefore sees either the
//! old or the new state of a course, never a partial one.

use crate::types::{Candidate, CourseCode, Embedding, RollNumber};
use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding model version mismatch: index uses {expected}, got {got}")]
    ModelVersionMismatch { expected: String, got: String },
    #[error("embedding is zero or non-finite")]
    InvalidEmbedding,
    #[error("no index published for course {0}")]
    IndexUnavailable(CourseCode),
}

/// A validated, normalized vector ready for insertion.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    roll: RollNumber,
    unit: Vec<f32>,
}

impl IndexEntry {
    pub fn roll(&self) -> &RollNumber {
        &self.roll
    }
}

/// Immutable search structure for one course.
#[derive(Debug)]
pub struct CourseIndex {
    course: CourseCode,
    /// Sorted by roll number.
    entries: Vec<IndexEntry>,
    fingerprint: [u8; 32],
}

impl CourseIndex {
    fn build(course: CourseCode, mut entries: Vec<IndexEntry>, model_version: &str) -> Self {
        entries.sort_by(|a, b| a.roll.cmp(&b.roll));
        entries.dedup_by(|a, b| a.roll == b.roll);

        let mut hasher = Sha256::new();
        hasher.update(model_version.as_bytes());
        for entry in &entries {
            hasher.update([0u8]);
            hasher.update(entry.roll.as_str().as_bytes());
            hasher.update([0u8]);
            for v in &entry.unit {
                hasher.update(v.to_le_bytes());
            }
        }

        Self {
            course,
            entries,
            fingerprint: hasher.finalize().into(),
        }
    }

    pub fn course(&self) -> &CourseCode {
        &self.course
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, roll: &RollNumber) -> bool {
        self.entries.binary_search_by(|e| e.roll.cmp(roll)).is_ok()
    }

    /// SHA-256 over the model version and every (roll, vector) pair.
    pub fn fingerprint(&self) -> String {
        self.fingerprint.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Exact scan. Results have similarity >= `threshold`, at most `k`
    /// of them, ordered by similarity descending then roll ascending.
    fn search(&self, probe: &[f32], k: usize, threshold: f32) -> Vec<Candidate> {
        if k == 0 {
            return Vec::new();
        }

        let mut hits: Vec<Candidate> = self
            .entries
            .iter()
            .map(|entry| Candidate {
                roll: entry.roll.clone(),
                similarity: dot(probe, &entry.unit).clamp(-1.0, 1.0),
            })
            .filter(|c| c.similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.roll.cmp(&b.roll))
        });
        hits.truncate(k);
        hits
    }
}

/// Entry count and fingerprint of a published course index.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CourseStats {
    pub course: CourseCode,
    pub entries: usize,
    pub fingerprint: String,
}

/// Outcome of [`VectorIndex::rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub entries: usize,
    /// False when the rebuilt index matched the published fingerprint.
    pub republished: bool,
}

type Snapshot = HashMap<CourseCode, Arc<CourseIndex>>;

/// Course-partitioned cosine index with snapshot publication.
pub struct VectorIndex {
    dimension: usize,
    model_version: String,
    published: ArcSwap<Snapshot>,
    writer: Mutex<()>,
}

impl VectorIndex {
    pub fn new(dimension: usize, model_version: impl Into<String>) -> Self {
        Self {
            dimension,
            model_version: model_version.into(),
            published: ArcSwap::from_pointee(Snapshot::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Validate and normalize an embedding for this index.
    pub fn prepare(&self, roll: RollNumber, embedding: &Embedding) -> Result<IndexEntry, IndexError> {
        let unit = self.unit_vector(embedding)?;
        Ok(IndexEntry { roll, unit })
    }

    /// Insert (or replace) one student's vector in a course.
    pub fn insert(
        &self,
        course: &CourseCode,
        roll: RollNumber,
        embedding: &Embedding,
    ) -> Result<(), IndexError> {
        let entry = self.prepare(roll, embedding)?;
        self.insert_entry(course, entry);
        Ok(())
    }

    /// Publish a new snapshot of `course` containing `entry`. An existing
    /// entry for the same roll number is replaced.
    pub fn insert_entry(&self, course: &CourseCode, entry: IndexEntry) {
        let _guard = self.lock_writer();
        let current = self.published.load_full();
        let mut entries: Vec<IndexEntry> = current
            .get(course)
            .map(|idx| {
                idx.entries
                    .iter()
                    .filter(|e| e.roll != entry.roll)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tracing::debug!(course = %course, roll = %entry.roll, "index insert");
        entries.push(entry);
        self.publish(&current, course, entries);
    }

    /// Remove a student from a course. Returns whether it was present.
    pub fn remove(&self, course: &CourseCode, roll: &RollNumber) -> bool {
        let _guard = self.lock_writer();
        let current = self.published.load_full();
        let Some(idx) = current.get(course) else {
            return false;
        };
        if !idx.contains(roll) {
            return false;
        }
        let entries = idx
            .entries
            .iter()
            .filter(|e| &e.roll != roll)
            .cloned()
            .collect();
        tracing::debug!(course = %course, roll = %roll, "index remove");
        self.publish(&current, course, entries);
        true
    }

    /// Replace a course's index wholesale. Readers keep using the old
    /// snapshot until the new one is published.
    pub fn rebuild(
        &self,
        course: &CourseCode,
        entries: impl IntoIterator<Item = IndexEntry>,
    ) -> RebuildOutcome {
        let rebuilt = CourseIndex::build(
            course.clone(),
            entries.into_iter().collect(),
            &self.model_version,
        );
        let count = rebuilt.len();

        let _guard = self.lock_writer();
        let current = self.published.load_full();
        if let Some(existing) = current.get(course) {
            if existing.fingerprint == rebuilt.fingerprint {
                tracing::debug!(course = %course, entries = count, "index unchanged; not republished");
                return RebuildOutcome {
                    entries: count,
                    republished: false,
                };
            }
        }

        let mut next = Snapshot::clone(&current);
        next.insert(course.clone(), Arc::new(rebuilt));
        self.published.store(Arc::new(next));
        tracing::info!(course = %course, entries = count, "index rebuilt and published");
        RebuildOutcome {
            entries: count,
            republished: true,
        }
    }

    /// Nearest neighbours of `probe` within `course`.
    ///
    /// An empty course index yields an empty result; a course that has
    /// never been published yields [`IndexError::IndexUnavailable`].
    pub fn query(
        &self,
        course: &CourseCode,
        probe: &Embedding,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<Candidate>, IndexError> {
        let unit = self.unit_vector(probe)?;
        let snapshot = self.published.load();
        let idx = snapshot
            .get(course)
            .ok_or_else(|| IndexError::IndexUnavailable(course.clone()))?;
        Ok(idx.search(&unit, k, threshold))
    }

    /// Currently published index for one course.
    pub fn snapshot(&self, course: &CourseCode) -> Option<Arc<CourseIndex>> {
        self.published.load().get(course).cloned()
    }

    pub fn stats(&self) -> Vec<CourseStats> {
        let snapshot = self.published.load();
        let mut stats: Vec<CourseStats> = snapshot
            .values()
            .map(|idx| CourseStats {
                course: idx.course.clone(),
                entries: idx.len(),
                fingerprint: idx.fingerprint(),
            })
            .collect();
        stats.sort_by(|a, b| a.course.cmp(&b.course));
        stats
    }

    fn unit_vector(&self, embedding: &Embedding) -> Result<Vec<f32>, IndexError> {
        if embedding.model_version != self.model_version {
            return Err(IndexError::ModelVersionMismatch {
                expected: self.model_version.clone(),
                got: embedding.model_version.clone(),
            });
        }
        if embedding.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.dimension(),
            });
        }
        embedding.normalized().ok_or(IndexError::InvalidEmbedding)
    }

    fn publish(&self, current: &Snapshot, course: &CourseCode, entries: Vec<IndexEntry>) {
        let mut next = current.clone();
        next.insert(
            course.clone(),
            Arc::new(CourseIndex::build(course.clone(), entries, &self.model_version)),
        );
        self.published.store(Arc::new(next));
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
