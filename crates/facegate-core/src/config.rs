//! Pipeline tuning parameters.
//!
//! Every numeric threshold used by the detector, extractor, matcher and
//! stabilizer lives here so the daemon, the preview loop and the probe share
//! one source of truth.

use serde::Deserialize;

// --- Defaults (behavioural contract, keep in sync with deployed models) ---
pub const DEFAULT_DETECTION_INPUT_SIZE: u32 = 640;
/// Minimum detector confidence; a candidate must be strictly above it.
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.55;
pub const DEFAULT_MIN_BOX_SIZE: f32 = 50.0;
/// Minimum box side for the diagnostic probe only.
pub const DIAGNOSTIC_MIN_BOX_SIZE: f32 = 10.0;
pub const DEFAULT_EMBEDDING_INPUT_SIZE: u32 = 112;
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
/// Maximum cosine distance for a recognized identity (strict `<`).
/// Unrelated to the detection confidence even though the values coincide.
pub const DEFAULT_MATCH_DISTANCE_THRESHOLD: f32 = 0.55;
pub const DEFAULT_DETECT_EVERY: u32 = 2;
pub const DEFAULT_MAX_MISSED_FRAMES: u32 = 6;
pub const DEFAULT_INTRA_THREADS: usize = 8;
pub const DEFAULT_INTER_THREADS: usize = 8;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Side of the square model input, in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    /// Minimum box width and height in original-frame pixels.
    pub min_box_size: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_DETECTION_INPUT_SIZE,
            confidence_threshold: DEFAULT_DETECTION_CONFIDENCE,
            min_box_size: DEFAULT_MIN_BOX_SIZE,
        }
    }
}

impl DetectionConfig {
    /// Same thresholds with the relaxed diagnostic box minimum.
    pub fn diagnostic(&self) -> Self {
        Self {
            min_box_size: DIAGNOSTIC_MIN_BOX_SIZE,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub input_size: u32,
    /// Expected length of the model output vector.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_EMBEDDING_INPUT_SIZE,
            dimension: DEFAULT_EMBEDDING_DIM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub distance_threshold: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            distance_threshold: DEFAULT_MATCH_DISTANCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Run the detector on every Nth frame (1 = every frame).
    pub detect_every: u32,
    /// Consecutive detector misses tolerated before the last face is dropped.
    pub max_missed_frames: u32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            detect_every: DEFAULT_DETECT_EVERY,
            max_missed_frames: DEFAULT_MAX_MISSED_FRAMES,
        }
    }
}

/// All pipeline thresholds, injected into each component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub embedding: EmbeddingConfig,
    pub matching: MatchingConfig,
    pub stabilizer: StabilizerConfig,
}

/// ONNX Runtime session options shared by both models.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            intra_threads: DEFAULT_INTRA_THREADS,
            inter_threads: DEFAULT_INTER_THREADS,
        }
    }
}
