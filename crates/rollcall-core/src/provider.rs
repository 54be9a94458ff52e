//! Seam to the external face-embedding model.

use crate::types::Detection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("cannot decode input: {0}")]
    Decode(String),
    #[error("embedding model failed: {0}")]
    Model(String),
}

/// Converts an uploaded image into one embedding per detected face.
///
/// Implementations must be deterministic for identical input. An image
/// with no faces yields an empty vector, not an error; callers that need
/// exactly one face (registration) enforce that themselves.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, image: &[u8]) -> Result<Vec<Detection>, ProviderError>;

    /// Output dimensionality of the model.
    fn dimension(&self) -> usize;

    /// Version tag stamped on every embedding this provider produces.
    fn model_version(&self) -> &str;
}
