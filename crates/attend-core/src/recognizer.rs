//! ArcFace embedding model via ONNX Runtime.
//!
//! Turns a canonical 112×112 RGB face into a raw 512-dimensional vector
//! using the w600k_r50 ArcFace export. Normalization happens in
//! [`crate::extractor::EmbeddingExtractor`].

use crate::extractor::EmbeddingModel;
use crate::preprocess::CANONICAL_FACE_SIZE;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

const _: () = assert!(ARCFACE_INPUT_SIZE == CANONICAL_FACE_SIZE as usize);

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; place w600k_r50.onnx in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face image is {0}x{1}, expected 112x112")]
    WrongInputSize(u32, u32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding model.
pub struct ArcFaceModel {
    session: Session,
}

impl ArcFaceModel {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Convert a canonical face into a normalized NCHW float tensor.
    fn to_input_tensor(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl EmbeddingModel for ArcFaceModel {
    type Error = RecognizerError;

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let (w, h) = face.dimensions();
        if w as usize != ARCFACE_INPUT_SIZE || h as usize != ARCFACE_INPUT_SIZE {
            return Err(RecognizerError::WrongInputSize(w, h));
        }

        let input = Self::to_input_tensor(face);

        // Output tensors are scoped to this block; nothing from the run survives the call.
        let raw: Vec<f32> = {
            let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_input_tensor_shape() {
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceModel::to_input_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_input_tensor_channels_follow_rgb() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = ArcFaceModel::to_input_tensor(&face);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }
}
