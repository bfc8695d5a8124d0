//! Per-frame recognition: preprocess, extract, match, debounce.
//!
//! Every failure here is terminal for one frame only. A frame with no face
//! or several faces counts as a miss and clears its debounce window; an
//! extraction or detector failure leaves the window as it was.

use crate::debounce::{DebounceState, Observation, RecognitionEvent, StationWindows};
use crate::detector::FaceDetect;
use crate::extractor::{EmbeddingExtractor, EmbeddingModel, ExtractionError};
use crate::gallery::{GalleryCache, GalleryError};
use crate::matcher::{DualThresholdMatcher, MatchOutcome, Matcher};
use crate::preprocess::{FacePreprocessor, FaceRegion, PreprocessError};
use crate::types::{Embedding, UserRef};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, exactly one is required")]
    MultipleFacesDetected(usize),
    #[error("face detection failed: {0}")]
    DetectionFailed(String),
    #[error("embedding extraction failed: {0}")]
    EmbeddingExtractionFailed(String),
    #[error("gallery has never been built")]
    GalleryUnavailable,
}

impl RecognitionError {
    /// Whether this failure counts as a debounce miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NoFaceDetected | Self::MultipleFacesDetected(_))
    }

    /// Short status shown to the person at the kiosk. Never carries detail.
    pub fn kiosk_status(&self) -> &'static str {
        match self {
            Self::NoFaceDetected => "no_face",
            Self::MultipleFacesDetected(_) => "multiple_faces",
            _ => "try_again",
        }
    }
}

impl From<PreprocessError> for RecognitionError {
    fn from(e: PreprocessError) -> Self {
        match e {
            PreprocessError::NoFaceDetected
            | PreprocessError::InvalidFaceRegion
            | PreprocessError::NoLandmarks => Self::NoFaceDetected,
            PreprocessError::MultipleFacesDetected(n) => Self::MultipleFacesDetected(n),
            PreprocessError::Detector(e) => Self::DetectionFailed(e.to_string()),
        }
    }
}

impl From<ExtractionError> for RecognitionError {
    fn from(e: ExtractionError) -> Self {
        Self::EmbeddingExtractionFailed(e.to_string())
    }
}

impl From<GalleryError> for RecognitionError {
    fn from(_: GalleryError) -> Self {
        Self::GalleryUnavailable
    }
}

/// Caller-facing answer for one image: accepted or not, who, how close.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub accepted: bool,
    pub user: Option<UserRef>,
    pub similarity: Option<f32>,
    pub distance: Option<f32>,
}

impl From<&MatchOutcome> for Verdict {
    fn from(outcome: &MatchOutcome) -> Self {
        match outcome {
            MatchOutcome::Matched(c) => Self {
                accepted: true,
                user: Some(c.user.clone()),
                similarity: Some(c.similarity),
                distance: Some(c.distance),
            },
            MatchOutcome::NoAcceptableMatch { .. } => Self {
                accepted: false,
                user: None,
                similarity: None,
                distance: None,
            },
        }
    }
}

/// Result of one recognition frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub outcome: MatchOutcome,
    pub state: DebounceState,
    pub region: FaceRegion,
    pub gallery_version: u64,
}

impl FrameReport {
    pub fn verdict(&self) -> Verdict {
        Verdict::from(&self.outcome)
    }

    /// The recognition event, if this frame completed a consensus.
    pub fn confirmed(&self) -> Option<&RecognitionEvent> {
        match &self.state {
            DebounceState::Confirmed(event) => Some(event),
            _ => None,
        }
    }
}

/// Owns the stateful inference pieces; gallery and windows are passed in.
pub struct RecognitionPipeline<D, M, X = DualThresholdMatcher> {
    preprocessor: FacePreprocessor<D>,
    extractor: EmbeddingExtractor<M>,
    matcher: X,
}

impl<D: FaceDetect, M: EmbeddingModel> RecognitionPipeline<D, M, DualThresholdMatcher> {
    pub fn new(detector: D, model: M, matcher: DualThresholdMatcher) -> Self {
        Self::with_matcher(detector, model, matcher)
    }
}

impl<D: FaceDetect, M: EmbeddingModel, X: Matcher> RecognitionPipeline<D, M, X> {
    pub fn with_matcher(detector: D, model: M, matcher: X) -> Self {
        Self {
            preprocessor: FacePreprocessor::new(detector),
            extractor: EmbeddingExtractor::new(model),
            matcher,
        }
    }

    pub fn matcher(&self) -> &X {
        &self.matcher
    }

    /// Canonicalize the single face in `image` and embed it.
    pub fn embed(&mut self, image: &RgbImage) -> Result<(Embedding, FaceRegion), RecognitionError> {
        let face = self.preprocessor.prepare(image)?;
        let embedding = self.extractor.extract(&face.image)?;
        Ok((embedding, face.region))
    }

    /// 1:N recognition of one frame from `station`, feeding its window.
    pub fn recognize(
        &mut self,
        image: &RgbImage,
        station: &str,
        gallery: &GalleryCache,
        windows: &StationWindows,
    ) -> Result<FrameReport, RecognitionError> {
        let snapshot = gallery.require()?;

        let (probe, region) = match self.embed(image) {
            Ok(found) => found,
            Err(e) => {
                if e.is_miss() {
                    windows.observe(station, Observation::Miss);
                }
                tracing::debug!(station, error = %e, "frame rejected");
                return Err(e);
            }
        };

        let outcome = self.matcher.identify(&probe, &snapshot);
        let observation = match &outcome {
            MatchOutcome::Matched(c) => Observation::Match(c.clone()),
            MatchOutcome::NoAcceptableMatch { closest } => {
                if let Some(c) = closest {
                    tracing::debug!(
                        station,
                        closest = %c.user.code,
                        similarity = c.similarity,
                        distance = c.distance,
                        "no acceptable match"
                    );
                }
                Observation::Miss
            }
        };

        let state = windows.observe(station, observation);
        if let DebounceState::Confirmed(event) = &state {
            tracing::info!(
                station,
                user = %event.user.code,
                similarity = event.similarity,
                distance = event.distance,
                "recognition confirmed"
            );
        }

        Ok(FrameReport {
            outcome,
            state,
            region,
            gallery_version: snapshot.version,
        })
    }

    /// 1:1 verification against `code`. Does not touch any window.
    pub fn verify(
        &mut self,
        image: &RgbImage,
        code: &str,
        gallery: &GalleryCache,
    ) -> Result<MatchOutcome, RecognitionError> {
        let snapshot = gallery.require()?;
        let (probe, _) = self.embed(image)?;
        Ok(self.matcher.verify(&probe, &snapshot, code))
    }
}
