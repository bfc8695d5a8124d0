//! attend-core: face recognition engine for attendance check-in.
//!
//! SCRFD finds the face, ArcFace embeds it, both via ONNX Runtime on the
//! CPU. Embeddings are matched against a versioned gallery snapshot under a
//! dual similarity/distance threshold, and a short sliding window of frames
//! must agree before anyone is reported as recognized.

pub mod debounce;
pub mod detector;
pub mod enhance;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use debounce::{DebounceConfig, DebounceState, RecognitionEvent, StationWindows, WindowScope};
pub use gallery::{GalleryCache, GallerySnapshot, GallerySource, StoredFaceRow};
pub use matcher::{DualThresholdMatcher, MatchOutcome, Thresholds};
pub use pipeline::{FrameReport, RecognitionError, RecognitionPipeline, Verdict};
pub use types::{BoundingBox, Embedding, UserRef};

/// File name of the SCRFD detector inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// File name of the ArcFace recognizer inside the model directory.
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// Model directory used when nothing else is configured.
pub fn default_model_dir() -> String {
    "/usr/share/attend/models".to_string()
}
