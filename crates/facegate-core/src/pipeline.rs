//! Detection → embedding → matching → decision, per frame and best-of-N.

use crate::config::PipelineConfig;
use crate::decision::{AccessPolicy, AccessReport};
use crate::detector::{DetectorError, FaceDetect};
use crate::matcher::{CosineMatcher, Matcher};
use crate::recognizer::{FaceEmbed, RecognizerError};
use crate::stabilizer::{StabilizedFace, TemporalStabilizer};
use crate::types::{Detection, Embedding, Frame, MatchResult, UserSnapshot};
use thiserror::Error;

/// Supplies frames in capture order.
pub trait FrameSource {
    /// Next frame, or `None` when this read failed. A failed read is
    /// transient; callers simply move on to the next cycle.
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Inference failures. Fatal to the current request only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Everything learned about the face in one frame.
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub detection: Detection,
    pub matched: MatchResult,
    pub report: AccessReport,
}

#[derive(Debug, Clone)]
pub enum AuthenticationOutcome {
    /// No attempt produced a face that passed the filters.
    NoFaceDetected,
    /// Lowest-distance attempt across the sampled frames.
    Decided(FrameAnalysis),
}

#[derive(Debug, Clone)]
pub struct EnrollmentCapture {
    pub embedding: Embedding,
    /// Detection confidence of the frame the embedding came from.
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub enum EnrollmentOutcome {
    NoFaceDetected,
    Captured(EnrollmentCapture),
}

/// The two models plus matching policy. Not `Sync`: one pipeline serves one
/// request at a time.
pub struct FacePipeline<D, E> {
    detector: D,
    embedder: E,
    matcher: CosineMatcher,
    policy: AccessPolicy,
}

impl<D: FaceDetect, E: FaceEmbed> FacePipeline<D, E> {
    pub fn new(detector: D, embedder: E, config: &PipelineConfig) -> Self {
        Self {
            detector,
            embedder,
            matcher: CosineMatcher,
            policy: AccessPolicy::new(&config.matching),
        }
    }

    /// Run the full pipeline on one frame. `Ok(None)` means no usable face.
    pub fn analyze_frame(
        &mut self,
        frame: &Frame,
        users: &UserSnapshot,
    ) -> Result<Option<FrameAnalysis>, PipelineError> {
        let Some(detection) = self.detector.detect(frame)? else {
            return Ok(None);
        };

        let embedding = self.embedder.extract(frame, &detection.bbox)?;
        let matched = self.matcher.nearest(&embedding, users);
        let report = AccessReport::from_match(&self.policy, &matched);

        tracing::debug!(
            frame = frame.sequence,
            confidence = detection.confidence,
            nearest = matched.user_name(),
            distance = matched.distance,
            outcome = %report.outcome,
            "frame analyzed"
        );

        Ok(Some(FrameAnalysis {
            detection,
            matched,
            report,
        }))
    }

    /// Sample up to `attempts` frames and decide on the one whose nearest
    /// user is closest. Earlier frames win ties. Failed reads still use up an
    /// attempt.
    pub fn authenticate(
        &mut self,
        source: &mut impl FrameSource,
        users: &UserSnapshot,
        attempts: usize,
    ) -> Result<AuthenticationOutcome, PipelineError> {
        let best = (0..attempts).try_fold(
            None,
            |best: Option<FrameAnalysis>, attempt| -> Result<Option<FrameAnalysis>, PipelineError> {
                let Some(frame) = source.next_frame() else {
                    tracing::debug!(attempt, "frame read failed, skipping");
                    return Ok(best);
                };
                let current = self.analyze_frame(&frame, users)?;
                Ok(match (best, current) {
                    (Some(b), Some(c)) if c.matched.distance < b.matched.distance => Some(c),
                    (None, c) => c,
                    (b, _) => b,
                })
            },
        )?;

        let outcome = match best {
            Some(analysis) => {
                tracing::info!(
                    outcome = %analysis.report.outcome,
                    user = %analysis.report.matched_name,
                    distance = analysis.report.distance,
                    "authentication decided"
                );
                AuthenticationOutcome::Decided(analysis)
            }
            None => {
                tracing::info!(attempts, "authentication: no face detected");
                AuthenticationOutcome::NoFaceDetected
            }
        };
        Ok(outcome)
    }

    /// Sample up to `attempts` frames, keep the most confident detection and
    /// embed only that one.
    pub fn capture_enrollment(
        &mut self,
        source: &mut impl FrameSource,
        attempts: usize,
    ) -> Result<EnrollmentOutcome, PipelineError> {
        let best = (0..attempts).try_fold(
            None,
            |best: Option<(Frame, Detection)>, attempt| -> Result<Option<(Frame, Detection)>, PipelineError> {
                let Some(frame) = source.next_frame() else {
                    tracing::debug!(attempt, "frame read failed, skipping");
                    return Ok(best);
                };
                let current = self.detector.detect(&frame)?;
                Ok(match (best, current) {
                    (Some((_, b)), Some(c)) if c.confidence > b.confidence => Some((frame, c)),
                    (None, Some(c)) => Some((frame, c)),
                    (b, _) => b,
                })
            },
        )?;

        let Some((frame, detection)) = best else {
            tracing::info!(attempts, "enrollment: no face detected");
            return Ok(EnrollmentOutcome::NoFaceDetected);
        };

        tracing::info!(
            confidence = detection.confidence,
            frame = frame.sequence,
            "enrollment: best face selected"
        );

        let embedding = self.embedder.extract(&frame, &detection.bbox)?;
        Ok(EnrollmentOutcome::Captured(EnrollmentCapture {
            embedding,
            confidence: detection.confidence,
        }))
    }

    /// Feed one preview frame through the stabilizer.
    pub fn preview_frame<'s>(
        &mut self,
        stabilizer: &'s mut TemporalStabilizer,
        frame: &Frame,
        users: &UserSnapshot,
    ) -> Result<Option<&'s StabilizedFace>, PipelineError> {
        stabilizer.advance(|| -> Result<Option<StabilizedFace>, PipelineError> {
            Ok(self
                .analyze_frame(frame, users)?
                .map(|a| StabilizedFace::from_report(a.detection.bbox, &a.report)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StabilizerConfig;
    use crate::types::{BoundingBox, EnrolledUser};
    use std::collections::VecDeque;

    /// Detector that replays a script, one entry per call.
    struct ScriptedDetector {
        script: VecDeque<Option<f32>>,
        calls: usize,
    }

    impl ScriptedDetector {
        fn new(confidences: &[Option<f32>]) -> Self {
            Self { script: confidences.iter().copied().collect(), calls: 0 }
        }
    }

    impl FaceDetect for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Option<Detection>, DetectorError> {
            self.calls += 1;
            Ok(self.script.pop_front().flatten().map(|confidence| Detection {
                bbox: BoundingBox { x1: 0, y1: 0, x2: 60, y2: 60 },
                confidence,
            }))
        }
    }

    /// Embedder that returns the first pixel's B value as a 2-d direction,
    /// so each test frame can carry its own embedding.
    struct PixelEmbedder {
        calls: usize,
    }

    impl FaceEmbed for PixelEmbedder {
        fn extract(&mut self, frame: &Frame, _bbox: &BoundingBox) -> Result<Embedding, RecognizerError> {
            self.calls += 1;
            let angle = frame.data[0] as f32 / 100.0;
            Ok(Embedding::new(vec![angle.cos(), angle.sin()]))
        }
    }

    struct FailingEmbedder;

    impl FaceEmbed for FailingEmbedder {
        fn extract(&mut self, _frame: &Frame, _bbox: &BoundingBox) -> Result<Embedding, RecognizerError> {
            Err(RecognizerError::InferenceFailed("shape mismatch".into()))
        }
    }

    /// Frame source replaying marker values; `None` simulates a failed read.
    struct ScriptedSource {
        frames: VecDeque<Option<u8>>,
        sequence: u32,
    }

    impl ScriptedSource {
        fn new(markers: &[Option<u8>]) -> Self {
            Self { frames: markers.iter().copied().collect(), sequence: 0 }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Option<Frame> {
            let marker = self.frames.pop_front().flatten()?;
            self.sequence += 1;
            let mut data = vec![0u8; 64 * 64 * 3];
            data[0] = marker;
            Some(Frame::from_bgr(data, 64, 64).unwrap().with_sequence(self.sequence))
        }
    }

    fn snapshot() -> UserSnapshot {
        // "ana" sits at angle 0, "luis" at angle 1.0 rad.
        UserSnapshot::new(vec![
            EnrolledUser { name: "ana".into(), embedding: Embedding::new(vec![1.0, 0.0]), access: true },
            EnrolledUser {
                name: "luis".into(),
                embedding: Embedding::new(vec![1.0f32.cos(), 1.0f32.sin()]),
                access: false,
            },
        ])
    }

    fn pipeline<E: FaceEmbed>(det: &[Option<f32>], embedder: E) -> FacePipeline<ScriptedDetector, E> {
        FacePipeline::new(ScriptedDetector::new(det), embedder, &PipelineConfig::default())
    }

    #[test]
    fn test_analyze_frame_no_face() {
        let mut p = pipeline(&[None], PixelEmbedder { calls: 0 });
        let frame = ScriptedSource::new(&[Some(0)]).next_frame().unwrap();
        assert!(p.analyze_frame(&frame, &snapshot()).unwrap().is_none());
        assert_eq!(p.embedder.calls, 0);
    }

    #[test]
    fn test_authenticate_keeps_lowest_distance() {
        // Markers: angle 0.40 (0.08 from ana), angle 0.05 (ana, ~0.001), angle 0.90 (near luis)
        let mut p = pipeline(&[Some(0.9), Some(0.6), Some(0.99)], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[Some(40), Some(5), Some(90)]);
        let outcome = p.authenticate(&mut src, &snapshot(), 3).unwrap();
        let AuthenticationOutcome::Decided(a) = outcome else {
            panic!("expected a decision");
        };
        assert_eq!(a.report.outcome, crate::types::AccessOutcome::Granted);
        assert_eq!(a.report.matched_name, "ana");
        assert!(a.matched.distance < 0.01);
        assert_eq!(a.detection.confidence, 0.6);
    }

    #[test]
    fn test_authenticate_recognized_but_denied() {
        let mut p = pipeline(&[Some(0.9)], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[Some(100)]);
        let AuthenticationOutcome::Decided(a) = p.authenticate(&mut src, &snapshot(), 1).unwrap() else {
            panic!("expected a decision");
        };
        assert_eq!(a.report.outcome, crate::types::AccessOutcome::RecognizedDenied);
        assert_eq!(a.report.matched_name, "luis");
    }

    #[test]
    fn test_authenticate_empty_store_is_unknown() {
        let mut p = pipeline(&[Some(0.9)], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[Some(10)]);
        let AuthenticationOutcome::Decided(a) =
            p.authenticate(&mut src, &UserSnapshot::default(), 1).unwrap()
        else {
            panic!("expected a decision");
        };
        assert_eq!(a.report.outcome, crate::types::AccessOutcome::Unknown);
        assert!(a.report.distance.is_infinite());
    }

    #[test]
    fn test_authenticate_no_face_and_failed_reads() {
        let mut p = pipeline(&[None, None], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[None, Some(1), None, Some(2)]);
        let outcome = p.authenticate(&mut src, &snapshot(), 4).unwrap();
        assert!(matches!(outcome, AuthenticationOutcome::NoFaceDetected));
        // Failed reads consume attempts without reaching the detector.
        assert_eq!(p.detector.calls, 2);
    }

    #[test]
    fn test_authenticate_propagates_inference_failure() {
        let mut p = pipeline(&[Some(0.9)], FailingEmbedder);
        let mut src = ScriptedSource::new(&[Some(1)]);
        let err = p.authenticate(&mut src, &snapshot(), 1).unwrap_err();
        assert!(matches!(err, PipelineError::Recognizer(_)));
    }

    #[test]
    fn test_enrollment_picks_highest_confidence_and_embeds_once() {
        let mut p = pipeline(&[Some(0.7), Some(0.95), None, Some(0.95), Some(0.8)], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[Some(10), Some(20), Some(30), Some(40), Some(50)]);
        let EnrollmentOutcome::Captured(capture) = p.capture_enrollment(&mut src, 5).unwrap() else {
            panic!("expected a capture");
        };
        assert_eq!(capture.confidence, 0.95);
        // Frame with marker 20 came first at 0.95; the later tie does not replace it.
        let expected = Embedding::new(vec![0.2f32.cos(), 0.2f32.sin()]);
        assert_eq!(capture.embedding, expected);
        assert_eq!(p.embedder.calls, 1);
    }

    #[test]
    fn test_enrollment_no_face() {
        let mut p = pipeline(&[None, None, None], PixelEmbedder { calls: 0 });
        let mut src = ScriptedSource::new(&[Some(1), None, Some(3)]);
        let outcome = p.capture_enrollment(&mut src, 3).unwrap();
        assert!(matches!(outcome, EnrollmentOutcome::NoFaceDetected));
        assert_eq!(p.embedder.calls, 0);
    }

    #[test]
    fn test_preview_frame_runs_on_cadence() {
        let mut p = pipeline(&[Some(0.9), Some(0.9)], PixelEmbedder { calls: 0 });
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        let mut src = ScriptedSource::new(&[Some(0), Some(0), Some(0), Some(0)]);
        let users = snapshot();
        for _ in 0..4 {
            let frame = src.next_frame().unwrap();
            let shown = p.preview_frame(&mut stabilizer, &frame, &users).unwrap();
            assert_eq!(shown.map(|f| f.label.as_str()), Some("ana (0.000)"));
        }
        assert_eq!(p.detector.calls, 2);
    }
}
