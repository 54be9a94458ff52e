//! Embedding provider backed by an upstream embedding service.
//!
//! The face model runs outside the daemon. Clients upload the service's
//! *detections document* in place of raw image bytes:
//!
//! ```json
//! {"model_version": "w600k_r50", "faces": [{"embedding": [0.01, ...], "score": 0.99}]}
//! ```

use rollcall_core::{Detection, Embedding, EmbeddingProvider, ProviderError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DetectionsDocument {
    model_version: String,
    #[serde(default)]
    faces: Vec<FaceEntry>,
}

#[derive(Debug, Deserialize)]
struct FaceEntry {
    embedding: Vec<f32>,
    score: Option<f32>,
}

pub struct PrecomputedProvider {
    dimension: usize,
    model_version: String,
}

impl PrecomputedProvider {
    pub fn new(dimension: usize, model_version: impl Into<String>) -> Self {
        Self {
            dimension,
            model_version: model_version.into(),
        }
    }
}

impl EmbeddingProvider for PrecomputedProvider {
    fn embed(&self, image: &[u8]) -> Result<Vec<Detection>, ProviderError> {
        let doc: DetectionsDocument = serde_json::from_slice(image)
            .map_err(|e| ProviderError::Decode(format!("detections document: {e}")))?;

        tracing::debug!(
            faces = doc.faces.len(),
            model_version = %doc.model_version,
            "decoded detections document"
        );

        Ok(doc
            .faces
            .into_iter()
            .map(|face| Detection {
                embedding: Embedding::new(face.embedding, doc.model_version.clone()),
                score: face.score.unwrap_or(1.0),
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}
