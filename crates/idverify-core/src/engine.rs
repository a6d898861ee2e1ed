use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{DetectedFace, Feature, Image, RequestTag};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face detection failed (code {0})")]
    Detection(i32),
    #[error("feature extraction failed (code {0})")]
    Extraction(i32),
    #[error("feature comparison failed: {0}")]
    Comparison(String),
    #[error("extraction queue is full")]
    QueueFull,
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("failed to spawn extractor thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("extractor thread exited")]
    ChannelClosed,
    #[error("recognizer panicked: {0}")]
    Panicked(String),
}

/// Synchronous capability of a face recognition engine.
///
/// Implementations wrap the vendor engine. Calls may come from different
/// threads; extraction always runs on the extractor thread.
pub trait Recognizer: Send + Sync + 'static {
    /// Activate or license the engine. Called once before any other method.
    fn activate(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Detect faces, most prominent first.
    fn detect_faces(&self, image: &Image) -> Result<Vec<DetectedFace>, EngineError>;

    fn extract_feature(&self, image: &Image, face: &DetectedFace) -> Result<Feature, EngineError>;

    /// Similarity in `[0, 1]` between a reference and a live feature.
    fn compare_features(&self, reference: &Feature, live: &Feature) -> Result<f32, EngineError>;
}

/// Completion of an asynchronous extraction request.
#[derive(Debug)]
pub struct FeatureResponse {
    pub tag: RequestTag,
    pub result: Result<Feature, EngineError>,
}

/// Engine operations as seen by the verification machine.
///
/// `request_feature` never blocks; its completion arrives later as a
/// [`FeatureResponse`] carrying the same tag.
pub trait FaceEngine {
    fn detect_faces(&self, image: &Image) -> Result<Vec<DetectedFace>, EngineError>;

    fn request_feature(&self, image: Image, face: DetectedFace, tag: RequestTag);

    fn compare_features(&self, reference: &Feature, live: &Feature) -> Result<f32, EngineError>;
}

/// Callback receiving extraction completions, on the extractor thread.
pub type ResponseFn = Arc<dyn Fn(FeatureResponse) + Send + Sync>;

struct ExtractRequest {
    image: Image,
    face: DetectedFace,
    tag: RequestTag,
}

/// Clone-safe handle to a recognizer and its extractor thread.
pub struct EngineHandle<R: Recognizer> {
    recognizer: Arc<R>,
    tx: mpsc::Sender<ExtractRequest>,
    respond: ResponseFn,
}

impl<R: Recognizer> Clone for EngineHandle<R> {
    fn clone(&self) -> Self {
        Self {
            recognizer: Arc::clone(&self.recognizer),
            tx: self.tx.clone(),
            respond: Arc::clone(&self.respond),
        }
    }
}

impl<R: Recognizer> EngineHandle<R> {
    /// Spawn the extractor on a dedicated OS thread.
    ///
    /// Up to `queue_size` requests wait for the extractor; further requests
    /// complete immediately with [`EngineError::QueueFull`]. The thread exits
    /// once every handle has been dropped.
    pub fn spawn(
        recognizer: Arc<R>,
        queue_size: usize,
        respond: ResponseFn,
    ) -> Result<Self, EngineError> {
        let (tx, mut rx) = mpsc::channel::<ExtractRequest>(queue_size.max(1));

        let worker = Arc::clone(&recognizer);
        let worker_respond = Arc::clone(&respond);
        std::thread::Builder::new()
            .name("idverify-extractor".into())
            .spawn(move || {
                tracing::info!("extractor thread started");
                while let Some(req) = rx.blocking_recv() {
                    let result = guarded(|| worker.extract_feature(&req.image, &req.face));
                    match &result {
                        Ok(_) => tracing::debug!(tag = ?req.tag, "feature extracted"),
                        Err(e) => tracing::debug!(tag = ?req.tag, error = %e, "feature extraction failed"),
                    }
                    worker_respond(FeatureResponse {
                        tag: req.tag,
                        result,
                    });
                }
                tracing::info!("extractor thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            recognizer,
            tx,
            respond,
        })
    }
}

/// Run a recognizer call, turning a panic into [`EngineError::Panicked`].
fn guarded<T>(call: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(panic = %message, "recognizer panicked");
        Err(EngineError::Panicked(message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<R: Recognizer> FaceEngine for EngineHandle<R> {
    fn detect_faces(&self, image: &Image) -> Result<Vec<DetectedFace>, EngineError> {
        guarded(|| self.recognizer.detect_faces(image))
    }

    fn request_feature(&self, image: Image, face: DetectedFace, tag: RequestTag) {
        let error = match self.tx.try_send(ExtractRequest { image, face, tag }) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => EngineError::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => EngineError::ChannelClosed,
        };
        tracing::warn!(?tag, error = %error, "feature request rejected");
        (self.respond)(FeatureResponse {
            tag,
            result: Err(error),
        });
    }

    fn compare_features(&self, reference: &Feature, live: &Feature) -> Result<f32, EngineError> {
        guarded(|| self.recognizer.compare_features(reference, live))
    }
}
