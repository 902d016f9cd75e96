//! facegate-core — Face detection, embedding, matching and access decisions.
//!
//! Uses a YOLO-style face detector and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference.

pub mod config;
pub mod decision;
pub mod detector;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
mod session;
pub mod stabilizer;
pub mod types;

pub use config::{InferenceConfig, PipelineConfig};
pub use decision::{AccessPolicy, AccessReport};
pub use detector::{FaceDetect, FaceDetector};
pub use matcher::{cosine_distance, CosineMatcher, Matcher};
pub use pipeline::{
    AuthenticationOutcome, EnrollmentCapture, EnrollmentOutcome, FacePipeline, FrameAnalysis,
    FrameSource, PipelineError,
};
pub use recognizer::{FaceEmbed, FaceRecognizer};
pub use stabilizer::{StabilizedFace, StabilizerState, TemporalStabilizer};
pub use types::{
    AccessOutcome, BoundingBox, Detection, Embedding, EnrolledUser, Frame, MatchResult,
    UserSnapshot, UNKNOWN_USER,
};

/// File name of the face detector model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "model.onnx";
/// File name of the ArcFace model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "arcface_r100.onnx";

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/facegate/models")
}
