use crate::store::{Store, StoreError};
use attendly_core::pipeline::{FrameSource, RawFrame, SourceError};
use attendly_core::{
    Embedding, FrameRef, Gallery, GalleryError, Identity, Pipeline, StepOutcome, CAPTURE_ERROR_BACKOFF,
};
use attendly_hw::{Camera, CameraError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no face detected in any enrollment image")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Camera settings used when capture starts.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub capturing: bool,
    pub camera_device: String,
    pub enrolled: usize,
    pub active_sessions: usize,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity_id: String,
        name: String,
        image_paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Remove {
        identity_id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StartCapture {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StopCapture {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Enroll an identity from image files. Returns the number of reference
    /// embeddings stored.
    pub async fn enroll(
        &self,
        identity_id: String,
        name: String,
        image_paths: Vec<PathBuf>,
    ) -> Result<usize, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll { identity_id, name, image_paths, reply }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn remove(&self, identity_id: String) -> Result<(), EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Remove { identity_id, reply }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Open the camera and start the capture loop. No-op if already capturing.
    pub async fn start_capture(&self) -> Result<(), EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineRequest::StartCapture { reply }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the capture loop and release the camera.
    pub async fn stop_capture(&self) -> Result<(), EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineRequest::StopCapture { reply }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Status { reply }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Opens a frame source on demand. The camera in production, scripted in tests.
pub trait SourceFactory: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, EngineError>;
    fn describe(&self) -> String;
}

/// Opens the V4L2 camera.
pub struct CameraFactory(pub CaptureSettings);

impl SourceFactory for CameraFactory {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, EngineError> {
        let camera = Camera::open(&self.0.device, self.0.width, self.0.height)?;
        tracing::info!(
            device = %self.0.device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(Box::new(CameraSource(camera)))
    }

    fn describe(&self) -> String {
        self.0.device.clone()
    }
}

/// Adapts the camera to the pipeline. Dark frames are reported as unusable.
struct CameraSource(Camera);

impl FrameSource for CameraSource {
    fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let frame = self.0.grab().map_err(|e| SourceError::Device(Box::new(e)))?;
        if frame.is_dark {
            return Err(SourceError::Unusable(format!("dark frame (seq {})", frame.sequence)));
        }
        Ok(Some(RawFrame {
            data: frame.data,
            width: frame.width,
            height: frame.height,
        }))
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The engine owns the pipeline (detector, encoder, tracker) and, while
/// capturing, the camera. Requests are serialised through one channel.
pub fn spawn_engine(
    pipeline: Pipeline,
    sources: Box<dyn SourceFactory>,
    gallery: Arc<Gallery>,
    store: Store,
) -> (EngineHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);

    let join = std::thread::Builder::new()
        .name("attendly-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            Engine { pipeline, sources, gallery, store }.run(rx);
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    (EngineHandle { tx }, join)
}

struct Engine {
    pipeline: Pipeline,
    sources: Box<dyn SourceFactory>,
    gallery: Arc<Gallery>,
    store: Store,
}

impl Engine {
    /// Idle: block on the next request. Capturing: one pipeline step, then
    /// drain pending requests without blocking.
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        loop {
            if !self.pipeline.is_attached() {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                continue;
            }

            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.pipeline.detach();
                        return;
                    }
                }
            }
            if !self.pipeline.is_attached() {
                continue;
            }

            match self.pipeline.step() {
                StepOutcome::CaptureFailed => std::thread::sleep(CAPTURE_ERROR_BACKOFF),
                StepOutcome::Ended => tracing::warn!("frame source ended; capture stopped"),
                _ => {}
            }
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { identity_id, name, image_paths, reply } => {
                let _ = reply.send(self.enroll(&identity_id, &name, &image_paths));
            }
            EngineRequest::Remove { identity_id, reply } => {
                let _ = reply.send(self.remove(&identity_id));
            }
            EngineRequest::StartCapture { reply } => {
                let _ = reply.send(self.start_capture());
            }
            EngineRequest::StopCapture { reply } => {
                if self.pipeline.is_attached() {
                    tracing::info!("capture stopped");
                }
                self.pipeline.detach();
                let _ = reply.send(());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    capturing: self.pipeline.is_attached(),
                    camera_device: self.sources.describe(),
                    enrolled: self.gallery.len(),
                    active_sessions: self.pipeline.tracker().active_count(),
                });
            }
        }
    }

    fn start_capture(&mut self) -> Result<(), EngineError> {
        if self.pipeline.is_attached() {
            tracing::debug!("capture already running");
            return Ok(());
        }
        let source = self.sources.open()?;
        self.pipeline.attach(source);
        tracing::info!("capture started");
        Ok(())
    }

    /// Embed the best face of every readable image, then add to the gallery
    /// and persist. A persistence failure rolls the gallery back.
    fn enroll(&mut self, identity_id: &str, name: &str, image_paths: &[PathBuf]) -> Result<usize, EngineError> {
        if self.gallery.contains(identity_id) {
            return Err(GalleryError::DuplicateIdentity(identity_id.to_string()).into());
        }

        let mut references = Vec::new();
        for path in image_paths {
            match self.embed_image(path) {
                Ok(Some(embedding)) => references.push(embedding),
                Ok(None) => tracing::warn!(path = %path.display(), "no usable face in image; skipped"),
                Err(reason) => tracing::warn!(path = %path.display(), %reason, "enrollment image skipped"),
            }
        }
        if references.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }
        let count = references.len();
        let identity = Identity {
            id: identity_id.to_string(),
            name: name.to_string(),
            references,
        };

        self.gallery.add(&identity.id, &identity.name, identity.references.clone())?;
        if let Err(err) = self.store.save_identity(&identity) {
            tracing::error!(identity = identity_id, error = %err, "failed to persist enrollment; rolling back");
            let _ = self.gallery.remove(identity_id);
            return Err(err.into());
        }

        tracing::info!(identity = identity_id, references = count, skipped = image_paths.len() - count, "enrollment complete");
        Ok(count)
    }

    fn embed_image(&mut self, path: &Path) -> Result<Option<Embedding>, String> {
        let image = image::open(path).map_err(|e| e.to_string())?.to_luma8();
        let frame = FrameRef::new(image.as_raw(), image.width(), image.height());
        self.pipeline
            .processor_mut()
            .best_embedding(&frame)
            .map_err(|e| e.to_string())
    }

    /// Remove from the gallery first so matching stops immediately; restore
    /// it if the store refuses the delete.
    fn remove(&mut self, identity_id: &str) -> Result<(), EngineError> {
        let removed = self.gallery.remove(identity_id)?;
        if let Err(err) = self.store.delete_identity(identity_id) {
            tracing::error!(identity = identity_id, error = %err, "failed to delete identity; restoring");
            let _ = self.gallery.add(&removed.id, &removed.name, removed.references);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendly_core::detector::{DetectError, FaceDetector};
    use attendly_core::encoder::{EncodeError, FaceEncoder};
    use attendly_core::matcher::LinearMatcher;
    use attendly_core::processor::FrameProcessor;
    use attendly_core::{spawn_dispatcher, BoundingBox, DistanceMetric, PipelineConfig, SinkHandle, SystemClock};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Reports one face wherever the frame has a pixel brighter than 128.
    struct BrightSpotDetector;

    impl FaceDetector for BrightSpotDetector {
        fn detect(&mut self, frame: &FrameRef<'_>) -> Result<Vec<BoundingBox>, DetectError> {
            let bright = frame.data.iter().any(|&p| p > 128);
            Ok(if bright {
                vec![BoundingBox { x: 0.0, y: 0.0, width: 2.0, height: 2.0, confidence: 0.9 }]
            } else {
                Vec::new()
            })
        }
    }

    /// Embeds a frame as its mean brightness on one axis.
    struct MeanEncoder;

    impl FaceEncoder for MeanEncoder {
        fn encode(&mut self, frame: &FrameRef<'_>, _region: &BoundingBox) -> Result<Embedding, EncodeError> {
            let mean = frame.data.iter().map(|&p| p as f32).sum::<f32>() / frame.data.len() as f32;
            Ok(Embedding::new(vec![mean / 255.0, 1.0]))
        }
    }

    /// Yields bright frames until dropped.
    struct EndlessSource {
        released: Arc<AtomicBool>,
    }

    impl FrameSource for EndlessSource {
        fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(Some(RawFrame { data: vec![200; 4], width: 2, height: 2 }))
        }
    }

    impl Drop for EndlessSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct TestSources {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl SourceFactory for TestSources {
        fn open(&mut self) -> Result<Box<dyn FrameSource>, EngineError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.released.store(false, Ordering::SeqCst);
            Ok(Box::new(EndlessSource { released: Arc::clone(&self.released) }))
        }

        fn describe(&self) -> String {
            "test".into()
        }
    }

    struct Fixture {
        engine: EngineHandle,
        gallery: Arc<Gallery>,
        store: Store,
        sink: SinkHandle,
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn fixture(tag: &str) -> Fixture {
        let config = PipelineConfig {
            tolerance: 0.05,
            metric: DistanceMetric::Euclidean,
            sample_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let gallery = Arc::new(Gallery::new());
        let store = Store::in_memory().unwrap();
        let (sink, _join) = spawn_dispatcher(Box::new(store.clone()), Default::default()).unwrap();
        let processor = FrameProcessor::new(
            Box::new(BrightSpotDetector),
            Box::new(MeanEncoder),
            Box::new(LinearMatcher::new(Arc::clone(&gallery), &config).unwrap()),
            &config,
        )
        .unwrap();
        let pipeline = Pipeline::new(processor, &config, sink.clone(), Box::new(SystemClock)).unwrap();

        let opened = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let sources = TestSources { opened: Arc::clone(&opened), released: Arc::clone(&released) };
        let (engine, _join) = spawn_engine(pipeline, Box::new(sources), Arc::clone(&gallery), store.clone());

        let dir = std::env::temp_dir().join(format!("attendly-engine-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        Fixture { engine, gallery, store, sink, opened, released, dir }
    }

    fn write_image(dir: &Path, name: &str, value: u8) -> PathBuf {
        let path = dir.join(name);
        image::GrayImage::from_pixel(4, 4, image::Luma([value])).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_enroll_skips_unusable_images_and_persists() {
        let f = fixture("enroll");
        let good = write_image(&f.dir, "good.png", 200);
        let dark = write_image(&f.dir, "dark.png", 10);
        let missing = f.dir.join("missing.png");

        let count = f.engine.enroll("s1".into(), "Ann".into(), vec![dark, good, missing]).await.unwrap();
        assert_eq!(count, 1);
        assert!(f.gallery.contains("s1"));
        let stored = f.store.load_identities().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Ann");
    }

    #[tokio::test]
    async fn test_enroll_without_faces_fails() {
        let f = fixture("noface");
        let dark = write_image(&f.dir, "dark.png", 10);
        let err = f.engine.enroll("s1".into(), "Ann".into(), vec![dark]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
        assert!(f.gallery.is_empty());
        assert!(f.store.load_identities().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_duplicate_rejected() {
        let f = fixture("dup");
        let good = write_image(&f.dir, "good.png", 200);
        f.engine.enroll("s1".into(), "Ann".into(), vec![good.clone()]).await.unwrap();
        let err = f.engine.enroll("s1".into(), "Ann".into(), vec![good]).await.unwrap_err();
        assert!(matches!(err, EngineError::Gallery(GalleryError::DuplicateIdentity(_))));
    }

    #[tokio::test]
    async fn test_remove_deletes_from_gallery_and_store() {
        let f = fixture("remove");
        let good = write_image(&f.dir, "good.png", 200);
        f.engine.enroll("s1".into(), "Ann".into(), vec![good]).await.unwrap();

        f.engine.remove("s1".into()).await.unwrap();
        assert!(!f.gallery.contains("s1"));
        assert!(f.store.load_identities().unwrap().is_empty());
        assert!(matches!(
            f.engine.remove("s1".into()).await,
            Err(EngineError::Gallery(GalleryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_capture_marks_attendance_and_stop_releases_camera() {
        let f = fixture("capture");
        let good = write_image(&f.dir, "good.png", 200);
        f.engine.enroll("s1".into(), "Ann".into(), vec![good]).await.unwrap();

        f.engine.start_capture().await.unwrap();
        f.engine.start_capture().await.unwrap();
        assert_eq!(f.opened.load(Ordering::SeqCst), 1);

        let mut status = f.engine.status().await.unwrap();
        for _ in 0..200 {
            if status.active_sessions == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = f.engine.status().await.unwrap();
        }
        assert!(status.capturing);
        assert_eq!(status.enrolled, 1);
        assert_eq!(status.active_sessions, 1);

        f.engine.stop_capture().await.unwrap();
        assert!(f.released.load(Ordering::SeqCst));
        let status = f.engine.status().await.unwrap();
        assert!(!status.capturing);
        assert_eq!(status.active_sessions, 0);

        // Stopping closes the open record.
        let today = chrono::Local::now().date_naive();
        let rows = f.sink.query(attendly_core::DateRange::day(today), Some("s1".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        let time_out = rows[0].time_out.expect("record closed on stop");
        assert!(time_out >= rows[0].time_in);
    }
}
