use serde::{Deserialize, Serialize};

/// Denominator substituted for a zero vector norm when scoring.
///
/// A corrupt all-zero gallery entry then scores as near-orthogonal to any
/// probe instead of producing NaN.
pub const NORM_EPSILON: f32 = 1e-10;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Left and right eye keypoints, if the detector produced landmarks.
    pub fn eyes(&self) -> Option<((f32, f32), (f32, f32))> {
        self.landmarks.map(|lms| (lms[0], lms[1]))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Wrap raw values without normalizing them.
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Wrap values after L2-normalizing them.
    ///
    /// A zero vector is returned unchanged.
    pub fn normalized(values: Vec<f32>) -> Self {
        Self {
            values: l2_normalize(values),
        }
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero norm on
    /// either side is replaced by [`NORM_EPSILON`].
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        dot / (safe_norm(norm_a.sqrt()) * safe_norm(norm_b.sqrt()))
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Identity of an enrolled user as seen by the recognition engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Stable numeric identifier from the store.
    pub id: i64,
    /// Unique human-facing member code.
    pub code: String,
    /// Display name.
    pub name: String,
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Divide by the L2 norm. Zero-norm input comes back unchanged.
pub fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&values);
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
    values
}

fn safe_norm(norm: f32) -> f32 {
    if norm == 0.0 { NORM_EPSILON } else { norm }
}
