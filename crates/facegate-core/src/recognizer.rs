//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Input layout contract: the deployed ArcFace R100 export takes **NHWC**
//! `[1, 112, 112, 3]` RGB input normalised as `(pixel - 127.5) / 128.0`.
//! Feeding NCHW to this model does not fail, it silently produces garbage
//! embeddings, so the layout is fixed here and checked against the model's
//! declared input shape at load time.

use crate::config::{EmbeddingConfig, InferenceConfig};
use crate::session::build_session;
use crate::types::{BoundingBox, Embedding, Frame};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from the detector!) ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 128.0;
const ARCFACE_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (place the ArcFace model in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model expects input shape {0:?}, which is not NHWC [1, H, W, 3]")]
    LayoutMismatch(Vec<i64>),
    #[error("face box {bbox:?} is outside the {width}x{height} frame")]
    InvalidCrop {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a face region into an identity embedding.
pub trait FaceEmbed {
    fn extract(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based embedding extractor.
pub struct FaceRecognizer {
    session: Session,
    config: EmbeddingConfig,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(
        model_path: &str,
        config: EmbeddingConfig,
        inference: &InferenceConfig,
    ) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = build_session(model_path, inference)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        if let Some(input) = session.inputs().first() {
            if let ValueType::Tensor { shape, .. } = input.dtype() {
                let dims: Vec<i64> = shape.iter().copied().collect();
                if !is_nhwc(&dims) {
                    return Err(RecognizerError::LayoutMismatch(dims));
                }
            }
        }

        Ok(Self { session, config })
    }

    /// Crop, resize and normalise a face region into an NHWC float tensor.
    fn preprocess(
        frame: &Frame,
        bbox: &BoundingBox,
        input_size: u32,
    ) -> Result<Array4<f32>, RecognizerError> {
        if bbox.x2 > frame.width || bbox.y2 > frame.height || bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
            return Err(RecognizerError::InvalidCrop {
                bbox: *bbox,
                width: frame.width,
                height: frame.height,
            });
        }

        // Exact rectangle, no padding. to_rgb_image() does the BGR -> RGB swap.
        let rgb = frame.to_rgb_image();
        let crop = image::imageops::crop_imm(&rgb, bbox.x1, bbox.y1, bbox.width(), bbox.height())
            .to_image();
        let resized = image::imageops::resize(&crop, input_size, input_size, FilterType::Triangle);

        let size = input_size as usize;
        let mut tensor = Array4::<f32>::zeros((1, size, size, ARCFACE_CHANNELS));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..ARCFACE_CHANNELS {
                tensor[[0, y, x, c]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        Ok(tensor)
    }
}

impl FaceEmbed for FaceRecognizer {
    /// Extract the raw (un-normalised) embedding for the face inside `bbox`.
    fn extract(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let input = Self::preprocess(frame, bbox, self.config.input_size)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != self.config.dimension {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.config.dimension,
                raw_data.len()
            )));
        }

        Ok(Embedding::new(raw_data.to_vec()))
    }
}

/// True when a declared input shape is `[N, H, W, 3]` (dynamic dims allowed).
fn is_nhwc(dims: &[i64]) -> bool {
    dims.len() == 4 && dims[3] == ARCFACE_CHANNELS as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_frame(w: u32, h: u32, bgr: [u8; 3]) -> Frame {
        let data = (0..(w * h)).flat_map(|_| bgr).collect();
        Frame::from_bgr(data, w, h).unwrap()
    }

    #[test]
    fn test_preprocess_output_shape_is_nhwc() {
        let frame = uniform_frame(200, 150, [128, 128, 128]);
        let bbox = BoundingBox { x1: 10, y1: 10, x2: 110, y2: 130 };
        let tensor = FaceRecognizer::preprocess(&frame, &bbox, 112).unwrap();
        assert_eq!(tensor.shape(), &[1, 112, 112, 3]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let frame = uniform_frame(120, 120, [255, 0, 128]);
        let bbox = BoundingBox { x1: 0, y1: 0, x2: 120, y2: 120 };
        let tensor = FaceRecognizer::preprocess(&frame, &bbox, 112).unwrap();
        // RGB order after swap: R=128, G=0, B=255
        let r = tensor[[0, 50, 50, 0]];
        let g = tensor[[0, 50, 50, 1]];
        let b = tensor[[0, 50, 50, 2]];
        assert!((r - (128.0 - 127.5) / 128.0).abs() < 1e-6, "r = {r}");
        assert!((g - (0.0 - 127.5) / 128.0).abs() < 1e-6, "g = {g}");
        assert!((b - (255.0 - 127.5) / 128.0).abs() < 1e-6, "b = {b}");
    }

    #[test]
    fn test_preprocess_crops_exact_rectangle() {
        // Left half white, right half black; crop only the left half.
        let (w, h) = (100u32, 60u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                let v = if x < 50 { 255 } else { 0 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let frame = Frame::from_bgr(data, w, h).unwrap();
        let bbox = BoundingBox { x1: 0, y1: 0, x2: 50, y2: 60 };
        let tensor = FaceRecognizer::preprocess(&frame, &bbox, 16).unwrap();
        let white = (255.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!(tensor.iter().all(|&v| (v - white).abs() < 1e-6));
    }

    #[test]
    fn test_preprocess_rejects_box_outside_frame() {
        let frame = uniform_frame(100, 100, [0, 0, 0]);
        let bbox = BoundingBox { x1: 60, y1: 0, x2: 120, y2: 60 };
        assert!(matches!(
            FaceRecognizer::preprocess(&frame, &bbox, 112),
            Err(RecognizerError::InvalidCrop { .. })
        ));
    }

    #[test]
    fn test_layout_check() {
        assert!(is_nhwc(&[1, 112, 112, 3]));
        assert!(is_nhwc(&[-1, 112, 112, 3]));
        assert!(!is_nhwc(&[1, 3, 112, 112]));
        assert!(!is_nhwc(&[112, 112, 3]));
    }
}
