use attend_core::detector::{DetectorError, FaceDetect, FaceDetector};
use attend_core::extractor::EmbeddingModel;
use attend_core::recognizer::{ArcFaceModel, RecognizerError};
use attend_core::{
    DualThresholdMatcher, Embedding, FrameReport, GalleryCache, MatchOutcome, RecognitionError, RecognitionPipeline,
    StationWindows, Thresholds,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("image {index}: {source}")]
    EnrollImage {
        index: usize,
        source: RecognitionError,
    },
    #[error("cannot spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        station: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
    Verify {
        code: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MatchOutcome, EngineError>>,
    },
    Embed {
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Vec<Embedding>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run one kiosk frame through recognition and the station's window.
    pub async fn recognize(&self, station: String, image: Vec<u8>) -> Result<FrameReport, EngineError> {
        self.call(|reply| EngineRequest::Recognize { station, image, reply }).await
    }

    /// 1:1 check of one image against a claimed member code.
    pub async fn verify(&self, code: String, image: Vec<u8>) -> Result<MatchOutcome, EngineError> {
        self.call(|reply| EngineRequest::Verify { code, image, reply }).await
    }

    /// Embed every image; fails as a whole if any one image fails.
    pub async fn embed_all(&self, images: Vec<Vec<u8>>) -> Result<Vec<Embedding>, EngineError> {
        self.call(|reply| EngineRequest::Embed { images, reply }).await
    }
}

/// Load both ONNX models and spawn the engine. Fails fast if either model
/// is missing.
pub fn spawn_engine(
    scrfd_path: &str,
    arcface_path: &str,
    thresholds: Thresholds,
    gallery: Arc<GalleryCache>,
    windows: Arc<StationWindows>,
) -> Result<EngineHandle, EngineError> {
    let detector = FaceDetector::load(scrfd_path)?;
    tracing::info!(path = scrfd_path, "SCRFD detector loaded");

    let model = ArcFaceModel::load(arcface_path)?;
    tracing::info!(path = arcface_path, "ArcFace model loaded");

    let pipeline = RecognitionPipeline::new(detector, model, DualThresholdMatcher::new(thresholds));
    spawn_pipeline(pipeline, gallery, windows)
}

/// Move `pipeline` onto a dedicated OS thread and serve requests from it.
///
/// Inference is serialized: one request at a time owns the models.
pub fn spawn_pipeline<D, M>(
    mut pipeline: RecognitionPipeline<D, M>,
    gallery: Arc<GalleryCache>,
    windows: Arc<StationWindows>,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetect + Send + 'static,
    M: EmbeddingModel + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("attend-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { station, image, reply } => {
                        let result = decode(&image).and_then(|frame| {
                            Ok(pipeline.recognize(&frame, &station, &gallery, &windows)?)
                        });
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify { code, image, reply } => {
                        let result =
                            decode(&image).and_then(|frame| Ok(pipeline.verify(&frame, &code, &gallery)?));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { images, reply } => {
                        let _ = reply.send(run_embed(&mut pipeline, &images));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn decode(bytes: &[u8]) -> Result<RgbImage, EngineError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Enrollment: every image must hold exactly one face.
fn run_embed<D: FaceDetect, M: EmbeddingModel>(
    pipeline: &mut RecognitionPipeline<D, M>,
    images: &[Vec<u8>],
) -> Result<Vec<Embedding>, EngineError> {
    let mut embeddings = Vec::with_capacity(images.len());
    for (index, bytes) in images.iter().enumerate() {
        let frame = decode(bytes)?;
        let (embedding, region) = pipeline
            .embed(&frame)
            .map_err(|source| EngineError::EnrollImage { index, source })?;
        tracing::debug!(index, x = region.x, y = region.y, width = region.width, "enroll: face embedded");
        embeddings.push(embedding);
    }
    Ok(embeddings)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use attend_core::debounce::{DebounceConfig, WindowScope};
    use attend_core::gallery::{GallerySource, StoredFaceRow};
    use attend_core::BoundingBox;
    use std::io::Cursor;

    /// Detector stub: one face in any frame wider than 100 px, two otherwise.
    pub(crate) struct WidthDetector;

    impl FaceDetect for WidthDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            let face = |x: f32| BoundingBox {
                x,
                y: 10.0,
                width: 40.0,
                height: 40.0,
                confidence: 0.95,
                landmarks: Some([
                    (x + 12.0, 26.0),
                    (x + 28.0, 26.0),
                    (x + 20.0, 34.0),
                    (x + 14.0, 42.0),
                    (x + 26.0, 42.0),
                ]),
            };
            if image.width() > 100 {
                Ok(vec![face(20.0)])
            } else {
                Ok(vec![face(5.0), face(50.0)])
            }
        }
    }

    /// Embedding stub: every face looks like SV100.
    pub(crate) struct ConstModel;

    impl EmbeddingModel for ConstModel {
        type Error = String;

        fn embed(&mut self, _face: &RgbImage) -> Result<Vec<f32>, String> {
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    struct Rows(Vec<StoredFaceRow>);

    impl GallerySource for Rows {
        type Error = String;

        fn fetch_rows(&self) -> Result<Vec<StoredFaceRow>, String> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([(x * 2) as u8, (y * 2) as u8, 100]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub(crate) fn stub_engine(gallery: Arc<GalleryCache>, windows: Arc<StationWindows>) -> EngineHandle {
        let pipeline = RecognitionPipeline::new(WidthDetector, ConstModel, DualThresholdMatcher::default());
        spawn_pipeline(pipeline, gallery, windows).unwrap()
    }

    fn built_gallery() -> Arc<GalleryCache> {
        let gallery = Arc::new(GalleryCache::new());
        gallery
            .rebuild(&Rows(vec![StoredFaceRow {
                user_id: 1,
                code: "SV100".into(),
                name: "Linh".into(),
                blob: "[1.0, 0.0, 0.0]".into(),
            }]))
            .unwrap();
        gallery
    }

    fn shared_windows() -> Arc<StationWindows> {
        Arc::new(StationWindows::new(WindowScope::Shared, DebounceConfig::default()))
    }

    #[tokio::test]
    async fn test_recognize_confirms_on_fourth_frame() {
        let engine = stub_engine(built_gallery(), shared_windows());
        for _ in 0..3 {
            let report = engine.recognize("gate-1".into(), png(160, 120)).await.unwrap();
            assert!(report.confirmed().is_none());
        }
        let report = engine.recognize("gate-1".into(), png(160, 120)).await.unwrap();
        assert_eq!(report.confirmed().unwrap().user.code, "SV100");
    }

    #[tokio::test]
    async fn test_recognize_rejects_two_faces() {
        let engine = stub_engine(built_gallery(), shared_windows());
        let err = engine.recognize("gate-1".into(), png(100, 80)).await.unwrap_err();
        assert!(matches!(err, EngineError::Recognition(RecognitionError::MultipleFacesDetected(2))));
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let engine = stub_engine(built_gallery(), shared_windows());
        let err = engine.verify("SV100".into(), b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_embed_all_or_nothing() {
        let engine = stub_engine(built_gallery(), shared_windows());
        let ok = engine.embed_all(vec![png(160, 120), png(200, 150)]).await.unwrap();
        assert_eq!(ok.len(), 2);

        let err = engine.embed_all(vec![png(160, 120), png(100, 80)]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::EnrollImage { index: 1, source: RecognitionError::MultipleFacesDetected(2) }
        ));
    }

    #[tokio::test]
    async fn test_embed_does_not_need_gallery() {
        let engine = stub_engine(Arc::new(GalleryCache::new()), shared_windows());
        assert_eq!(engine.embed_all(vec![png(160, 120)]).await.unwrap().len(), 1);
    }
}
