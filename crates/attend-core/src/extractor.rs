//! Embedding extraction behind a model capability boundary.

use crate::types::Embedding;
use image::RgbImage;
use thiserror::Error;

/// A face-embedding model: canonical face in, raw vector out.
///
/// [`crate::recognizer::ArcFaceModel`] is the production implementation.
/// Implementations must not keep per-call inference state alive after
/// `embed` returns.
pub trait EmbeddingModel {
    type Error: std::fmt::Display;

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("embedding model failed: {0}")]
    Model(String),
    #[error("embedding model returned an empty vector")]
    Empty,
}

/// Wraps a model and unit-normalizes everything it produces.
pub struct EmbeddingExtractor<M> {
    model: M,
}

impl<M: EmbeddingModel> EmbeddingExtractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Embed one canonical face. A zero vector comes back as-is.
    pub fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractionError> {
        let raw = self
            .model
            .embed(face)
            .map_err(|e| ExtractionError::Model(e.to_string()))?;

        if raw.is_empty() {
            return Err(ExtractionError::Empty);
        }

        Ok(Embedding::normalized(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("model crashed")]
    struct Crash;

    struct Fixed(Result<Vec<f32>, ()>);

    impl EmbeddingModel for Fixed {
        type Error = Crash;

        fn embed(&mut self, _face: &RgbImage) -> Result<Vec<f32>, Crash> {
            self.0.clone().map_err(|_| Crash)
        }
    }

    fn face() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn test_extract_normalizes() {
        let mut ex = EmbeddingExtractor::new(Fixed(Ok(vec![0.0, 3.0, 4.0])));
        let emb = ex.extract(&face()).unwrap();
        assert!((emb.norm() - 1.0).abs() < 1e-6);
        assert!((emb.values[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_extract_zero_vector_passthrough() {
        let mut ex = EmbeddingExtractor::new(Fixed(Ok(vec![0.0; 8])));
        let emb = ex.extract(&face()).unwrap();
        assert_eq!(emb.values, vec![0.0; 8]);
    }

    #[test]
    fn test_extract_model_error() {
        let mut ex = EmbeddingExtractor::new(Fixed(Err(())));
        let err = ex.extract(&face()).unwrap_err();
        assert!(matches!(err, ExtractionError::Model(ref m) if m == "model crashed"));
    }

    #[test]
    fn test_extract_empty_output() {
        let mut ex = EmbeddingExtractor::new(Fixed(Ok(vec![])));
        assert!(matches!(ex.extract(&face()), Err(ExtractionError::Empty)));
    }
}
