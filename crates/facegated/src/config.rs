use anyhow::{Context, Result};
use facegate_core::{InferenceConfig, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: optional TOML file, then `FACEGATE_*` environment
/// overrides, then defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path; `None` probes /dev/video0..4.
    pub camera_device: Option<String>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Number of warmup frames to discard at startup (camera AE settling).
    pub warmup_frames: usize,
    /// Frames sampled per authentication request.
    pub auth_attempts: usize,
    /// Frames sampled per registration request.
    pub enroll_attempts: usize,
    /// Whether newly registered users may enter immediately. Off by default:
    /// an administrator approves them with ToggleAccess.
    pub auto_grant_access: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    pub pipeline: PipelineConfig,
    pub inference: InferenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            camera_device: None,
            model_dir: facegate_core::default_model_dir(),
            db_path: data_dir.join("users.db"),
            warmup_frames: 4,
            auth_attempts: 10,
            enroll_attempts: 15,
            auto_grant_access: false,
            session_bus: false,
            pipeline: PipelineConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Config {
    /// Load from `$FACEGATE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `FACEGATE_*` overrides; unparsable values are ignored.
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = Some(v);
        }
        if let Some(v) = get("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&get, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&get, "FACEGATE_AUTH_ATTEMPTS", &mut self.auth_attempts);
        override_parsed(&get, "FACEGATE_ENROLL_ATTEMPTS", &mut self.enroll_attempts);
        override_parsed(
            &get,
            "FACEGATE_MATCH_THRESHOLD",
            &mut self.pipeline.matching.distance_threshold,
        );
        override_parsed(
            &get,
            "FACEGATE_DETECTION_THRESHOLD",
            &mut self.pipeline.detection.confidence_threshold,
        );
        if let Some(v) = get("FACEGATE_AUTO_GRANT_ACCESS") {
            self.auto_grant_access = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = get("FACEGATE_SESSION_BUS") {
            self.session_bus = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    /// Path to the face detector model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(facegate_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(facegate_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = get(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}
