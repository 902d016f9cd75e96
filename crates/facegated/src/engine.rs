use crate::config::Config;
use facegate_core::{
    AuthenticationOutcome, EnrollmentOutcome, FaceDetector, FacePipeline, FaceRecognizer,
    PipelineError, UserSnapshot,
};
use facegate_hw::{Camera, CameraError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] facegate_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] facegate_core::recognizer::RecognizerError),
    #[error("inference failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Camera facts fixed at startup, for status reporting.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

/// Messages sent from D-Bus handlers to the engine thread.
pub(crate) enum EngineRequest {
    Authenticate {
        users: Arc<UserSnapshot>,
        attempts: usize,
        reply: oneshot::Sender<Result<AuthenticationOutcome, EngineError>>,
    },
    Enroll {
        attempts: usize,
        reply: oneshot::Sender<Result<EnrollmentOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    pub camera: CameraInfo,
}

impl EngineHandle {
    /// Request authentication: sample frames, match the best against `users`.
    pub async fn authenticate(
        &self,
        users: Arc<UserSnapshot>,
        attempts: usize,
    ) -> Result<AuthenticationOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Authenticate {
                users,
                attempts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request enrollment capture: sample frames, embed the most confident face.
    pub async fn enroll(&self, attempts: usize) -> Result<EnrollmentOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                attempts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

#[cfg(test)]
impl EngineHandle {
    /// A handle with no engine thread behind it; requests pile up on the
    /// returned receiver.
    pub(crate) fn detached() -> (Self, mpsc::Receiver<EngineRequest>) {
        let (tx, rx) = mpsc::channel(4);
        let camera = CameraInfo {
            device: "/dev/null".into(),
            width: 640,
            height: 480,
        };
        (Self { tx, camera }, rx)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the camera, loads both ONNX models, discards warmup frames, then
/// serves one request at a time: the model sessions are never shared
/// between concurrent callers. Fails fast at startup if any resource is
/// unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let camera = match &config.camera_device {
        Some(device) => Camera::open(device)?,
        None => Camera::open_first_available()?,
    };
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(
        &detector_path,
        config.pipeline.detection.clone(),
        &config.inference,
    )?;
    tracing::info!(path = %detector_path, "face detector loaded");

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(
        &recognizer_path,
        config.pipeline.embedding.clone(),
        &config.inference,
    )?;
    tracing::info!(path = %recognizer_path, "ArcFace recognizer loaded");

    let mut pipeline = FacePipeline::new(detector, recognizer, &config.pipeline);

    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        camera.stream()?.discard(config.warmup_frames);
    }

    let info = CameraInfo {
        device: camera.device_path.clone(),
        width: camera.width,
        height: camera.height,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Authenticate {
                        users,
                        attempts,
                        reply,
                    } => {
                        let result = run_authenticate(&camera, &mut pipeline, &users, attempts);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll { attempts, reply } => {
                        let result = run_enroll(&camera, &mut pipeline, attempts);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, camera: info })
}

type Pipeline = FacePipeline<FaceDetector, FaceRecognizer>;

fn run_authenticate(
    camera: &Camera,
    pipeline: &mut Pipeline,
    users: &UserSnapshot,
    attempts: usize,
) -> Result<AuthenticationOutcome, EngineError> {
    let mut stream = camera.stream()?;
    tracing::debug!(attempts, users = users.len(), "authenticate: sampling frames");
    Ok(pipeline.authenticate(&mut stream, users, attempts)?)
}

fn run_enroll(
    camera: &Camera,
    pipeline: &mut Pipeline,
    attempts: usize,
) -> Result<EnrollmentOutcome, EngineError> {
    let mut stream = camera.stream()?;
    tracing::debug!(attempts, "enroll: sampling frames");
    Ok(pipeline.capture_enrollment(&mut stream, attempts)?)
}
