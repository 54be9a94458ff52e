//! Accept / reject / flag decisions over scored index candidates.

use crate::types::Candidate;
use serde::{Deserialize, Serialize};

/// Default minimum cosine similarity for a confident match.
pub const DEFAULT_THRESHOLD: f32 = 0.40;
/// Default margin under which two candidates count as tied.
pub const DEFAULT_AMBIGUITY_MARGIN: f32 = 0.02;

/// Verdict for one probe face.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Match(Candidate),
    /// No candidate reached the threshold. Not an error: a normal outcome.
    Unrecognized { best_similarity: f32 },
    /// Two or more candidates at or above threshold within the margin of
    /// the best one. Never resolved by ordering.
    Ambiguous { candidates: Vec<Candidate> },
}

/// Strategy for turning index candidates into a decision.
pub trait Matcher {
    /// `candidates` must be sorted by similarity, best first.
    fn decide(&self, candidates: &[Candidate]) -> Decision;
}

/// Threshold matcher with tie detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMatcher {
    pub threshold: f32,
    pub ambiguity_margin: f32,
}

impl Default for ThresholdMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
        }
    }
}

impl Matcher for ThresholdMatcher {
    fn decide(&self, candidates: &[Candidate]) -> Decision {
        let Some(best) = candidates.first() else {
            return Decision::Unrecognized {
                best_similarity: 0.0,
            };
        };

        if best.similarity < self.threshold {
            return Decision::Unrecognized {
                best_similarity: best.similarity,
            };
        }

        let tied: Vec<Candidate> = candidates
            .iter()
            .filter(|c| {
                c.similarity >= self.threshold
                    && best.similarity - c.similarity <= self.ambiguity_margin
            })
            .cloned()
            .collect();

        if tied.len() > 1 {
            Decision::Ambiguous { candidates: tied }
        } else {
            Decision::Match(best.clone())
        }
    }
}
