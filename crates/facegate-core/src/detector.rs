//! YOLO-style single-face detector via ONNX Runtime.
//!
//! The model takes a square RGB NCHW tensor scaled to [0, 1] and emits a
//! `[1, F, N]` tensor whose first five rows are x-center, y-center, width,
//! height and confidence for each of the N anchors, in model-input pixels.
//! Only the best surviving candidate is reported per frame.

use crate::config::{DetectionConfig, InferenceConfig};
use crate::session::build_session;
use crate::types::{BoundingBox, Detection, Frame};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Rows of the output tensor consumed by the decoder.
const OUTPUT_ROWS: usize = 5;
const ROW_CX: usize = 0;
const ROW_CY: usize = 1;
const ROW_W: usize = 2;
const ROW_H: usize = 3;
const ROW_CONF: usize = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place the face detector in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unexpected detector output shape {0:?}, expected [1, >=5, N]")]
    UnexpectedShape(Vec<usize>),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can locate at most one face per frame.
pub trait FaceDetect {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>, DetectorError>;
}

/// Face detector backed by an ONNX Runtime session.
pub struct FaceDetector {
    session: Session,
    config: DetectionConfig,
}

impl FaceDetector {
    /// Load the detector ONNX model from the given path.
    pub fn load(
        model_path: &str,
        config: DetectionConfig,
        inference: &InferenceConfig,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = build_session(model_path, inference)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = config.input_size,
            "loaded face detector model"
        );

        Ok(Self { session, config })
    }

    /// Every candidate that clears the confidence and geometry filters,
    /// highest confidence first. Diagnostic use only; authentication goes
    /// through [`FaceDetect::detect`].
    pub fn candidates(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let config = self.config.clone();
        self.with_output(frame, |output, num_anchors| {
            let mut found: Vec<Detection> = (0..num_anchors)
                .filter(|&i| output[ROW_CONF * num_anchors + i] > config.confidence_threshold)
                .filter_map(|i| {
                    candidate_box(output, num_anchors, i, frame.width, frame.height, &config).map(
                        |bbox| Detection {
                            bbox,
                            confidence: output[ROW_CONF * num_anchors + i],
                        },
                    )
                })
                .collect();
            found.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            found
        })
    }

    /// Run inference and hand the raw `[F, N]` row-major output to `decode`.
    fn with_output<T>(
        &mut self,
        frame: &Frame,
        decode: impl FnOnce(&[f32], usize) -> T,
    ) -> Result<T, DetectorError> {
        let input = preprocess(frame, self.config.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        if outputs.len() == 0 {
            return Err(DetectorError::InferenceFailed("detector produced no outputs".into()));
        }

        let tensor = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;
        let shape = tensor.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < OUTPUT_ROWS {
            return Err(DetectorError::UnexpectedShape(shape));
        }
        let num_anchors = shape[2];

        let data = tensor
            .as_slice()
            .ok_or_else(|| DetectorError::InferenceFailed("non-contiguous detector output".into()))?;

        Ok(decode(data, num_anchors))
    }
}

impl FaceDetect for FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>, DetectorError> {
        let config = self.config.clone();
        let best = self.with_output(frame, |output, num_anchors| {
            select_best_candidate(output, num_anchors, frame.width, frame.height, &config)
        })?;

        match &best {
            Some(d) => tracing::debug!(
                confidence = d.confidence,
                x1 = d.bbox.x1,
                y1 = d.bbox.y1,
                x2 = d.bbox.x2,
                y2 = d.bbox.y2,
                "face detected"
            ),
            None => tracing::debug!(frame = frame.sequence, "no face passed filters"),
        }

        Ok(best)
    }
}

/// Pick the highest-confidence candidate that clears the threshold and the
/// geometry filters.
///
/// `output` holds at least five rows of `num_anchors` values each (see module
/// docs). Candidates rejected by geometry do not raise the running maximum, and
/// an equal confidence never replaces the incumbent, so the earliest anchor
/// wins ties.
pub fn select_best_candidate(
    output: &[f32],
    num_anchors: usize,
    frame_width: u32,
    frame_height: u32,
    config: &DetectionConfig,
) -> Option<Detection> {
    if output.len() < OUTPUT_ROWS * num_anchors {
        return None;
    }

    let mut best: Option<Detection> = None;

    for i in 0..num_anchors {
        let confidence = output[ROW_CONF * num_anchors + i];
        if !(confidence > config.confidence_threshold) {
            continue;
        }
        if best.as_ref().is_some_and(|b| confidence <= b.confidence) {
            continue;
        }
        if let Some(bbox) = candidate_box(output, num_anchors, i, frame_width, frame_height, config) {
            best = Some(Detection { bbox, confidence });
        }
    }

    best
}

/// Rescale anchor `i` to frame coordinates and apply the geometry filters.
fn candidate_box(
    output: &[f32],
    num_anchors: usize,
    i: usize,
    frame_width: u32,
    frame_height: u32,
    config: &DetectionConfig,
) -> Option<BoundingBox> {
    let fw = frame_width as f32;
    let fh = frame_height as f32;
    // Independent x/y scales: the model input is square, frames usually aren't.
    let scale_x = fw / config.input_size as f32;
    let scale_y = fh / config.input_size as f32;

    let cx = output[ROW_CX * num_anchors + i] * scale_x;
    let cy = output[ROW_CY * num_anchors + i] * scale_y;
    let w = output[ROW_W * num_anchors + i] * scale_x;
    let h = output[ROW_H * num_anchors + i] * scale_y;

    // Negated comparisons also reject NaN.
    if !(w >= config.min_box_size && h >= config.min_box_size) {
        return None;
    }

    // Corners truncate toward zero before the frame check, so a corner a
    // fraction of a pixel outside the frame lands on the edge.
    let x1 = (cx - w / 2.0) as i64;
    let y1 = (cy - h / 2.0) as i64;
    let x2 = (cx + w / 2.0) as i64;
    let y2 = (cy + h / 2.0) as i64;

    if x1 < 0 || y1 < 0 || x2 > i64::from(frame_width) || y2 > i64::from(frame_height) {
        return None;
    }
    // NaN centres truncate to 0 and collapse the box.
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(BoundingBox {
        x1: x1 as u32,
        y1: y1 as u32,
        x2: x2 as u32,
        y2: y2 as u32,
    })
}

/// Resize a BGR frame to the square model input, convert to RGB, scale to
/// [0, 1] and lay out as NCHW.
fn preprocess(frame: &Frame, input_size: u32) -> Array4<f32> {
    let rgb = frame.to_rgb_image();
    let resized = image::imageops::resize(&rgb, input_size, input_size, FilterType::Triangle);

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}
