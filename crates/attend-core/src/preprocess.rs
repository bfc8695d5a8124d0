//! Face preprocessing: detect, crop, level the eyes, resize, equalize.
//!
//! Produces the canonical 112×112 RGB face the embedding model expects.
//! Frames with zero or several faces are rejected outright; attendance is
//! never attributed from an ambiguous multi-subject frame.

use crate::detector::{resize_bilinear, DetectorError, FaceDetect};
use crate::enhance::{equalize_lightness, CLAHE_CLIP_LIMIT, CLAHE_TILES};
use crate::types::BoundingBox;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the canonical face image.
pub const CANONICAL_FACE_SIZE: u32 = 112;

/// Crop margin on every side, as a fraction of the larger box dimension.
const CROP_MARGIN_RATIO: f32 = 0.1;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, exactly one is required")]
    MultipleFacesDetected(usize),
    #[error("face region is empty after clamping to the image")]
    InvalidFaceRegion,
    #[error("face has no eye landmarks")]
    NoLandmarks,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

/// Pixel rectangle of the margin-expanded crop, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A face ready for embedding extraction.
#[derive(Debug, Clone)]
pub struct PreparedFace {
    /// Canonical `CANONICAL_FACE_SIZE`² RGB image.
    pub image: RgbImage,
    /// Where the crop came from in the original frame.
    pub region: FaceRegion,
    /// Roll correction applied, in degrees.
    pub angle: f32,
}

/// Runs detection and canonicalization for one frame.
pub struct FacePreprocessor<D> {
    detector: D,
}

impl<D: FaceDetect> FacePreprocessor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Detect exactly one face in `image` and canonicalize it.
    pub fn prepare(&mut self, image: &RgbImage) -> Result<PreparedFace, PreprocessError> {
        let faces = self.detector.detect(image)?;
        let face = select_single_face(&faces)?;
        tracing::trace!(confidence = face.confidence, "face selected");
        canonicalize(image, face)
    }
}

/// Enforce the single-subject policy.
pub fn select_single_face(faces: &[BoundingBox]) -> Result<&BoundingBox, PreprocessError> {
    match faces {
        [] => Err(PreprocessError::NoFaceDetected),
        [face] => Ok(face),
        many => Err(PreprocessError::MultipleFacesDetected(many.len())),
    }
}

/// Crop, level, resize and equalize a detected face.
pub fn canonicalize(image: &RgbImage, face: &BoundingBox) -> Result<PreparedFace, PreprocessError> {
    let (left_eye, right_eye) = face.eyes().ok_or(PreprocessError::NoLandmarks)?;
    let region = margin_region(face, image.width(), image.height())
        .ok_or(PreprocessError::InvalidFaceRegion)?;

    let crop = image::imageops::crop_imm(image, region.x, region.y, region.width, region.height)
        .to_image();

    let angle = eye_roll_degrees(left_eye, right_eye);
    let leveled = if angle == 0.0 { crop } else { rotate_about_center(&crop, angle) };

    let mut canonical = resize_bilinear(&leveled, CANONICAL_FACE_SIZE, CANONICAL_FACE_SIZE);
    equalize_lightness(&mut canonical, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    Ok(PreparedFace {
        image: canonical,
        region,
        angle,
    })
}

/// Expand the box by the margin and clamp it to the frame.
///
/// Returns `None` when nothing of the box lies inside the frame.
pub fn margin_region(face: &BoundingBox, frame_w: u32, frame_h: u32) -> Option<FaceRegion> {
    let (x, y) = (face.x.floor() as i64, face.y.floor() as i64);
    let (w, h) = (face.width.round() as i64, face.height.round() as i64);
    if w <= 0 || h <= 0 {
        return None;
    }

    let margin = (w.max(h) as f32 * CROP_MARGIN_RATIO) as i64;
    let x0 = (x - margin).max(0);
    let y0 = (y - margin).max(0);
    let x1 = (x + w + margin).min(frame_w as i64);
    let y1 = (y + h + margin).min(frame_h as i64);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(FaceRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Roll angle of the eye line in degrees, wrapped into [-90, 90].
pub fn eye_roll_degrees(left_eye: (f32, f32), right_eye: (f32, f32)) -> f32 {
    let dx = right_eye.0 - left_eye.0;
    let dy = right_eye.1 - left_eye.1;
    if dx == 0.0 {
        return 0.0;
    }

    let angle = dy.atan2(dx).to_degrees();
    if angle > 90.0 {
        angle - 180.0
    } else if angle < -90.0 {
        angle + 180.0
    } else {
        angle
    }
}

/// Rotate counter-clockwise (image coordinates, y down) by `angle` degrees
/// about the image center, keeping the size. Uncovered pixels are black.
pub fn rotate_about_center(image: &RgbImage, angle: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    let cx = (w / 2) as f32;
    let cy = (h / 2) as f32;
    let (sin, cos) = angle.to_radians().sin_cos();

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w as i64 && y >= 0 && y < h as i64 {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(w, h, |ox, oy| {
        // Inverse map: destination pixel back into the source.
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cos * dx - sin * dy + cx;
        let sy = sin * dx + cos * dy + cy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        image::Rgb(std::array::from_fn(|c| {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            val.round().clamp(0.0, 255.0) as u8
        }))
    })
}
