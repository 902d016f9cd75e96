//! ONNX Runtime session construction shared by both models.

use crate::config::InferenceConfig;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

/// Build a CPU session with full graph optimisation and the configured thread pools.
pub(crate) fn build_session(model_path: &str, cfg: &InferenceConfig) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(cfg.intra_threads)?
        .with_inter_threads(cfg.inter_threads)?
        .commit_from_file(model_path)?;

    tracing::debug!(
        path = model_path,
        intra_threads = cfg.intra_threads,
        inter_threads = cfg.inter_threads,
        "ONNX session built"
    );

    Ok(session)
}
