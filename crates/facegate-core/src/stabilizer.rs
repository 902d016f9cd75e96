//! Display smoothing for the live preview loop.
//!
//! Detectors flicker near their threshold. The stabilizer runs the full
//! pipeline only every `detect_every` frames and keeps showing the last face
//! for up to `max_missed_frames` consecutive misses before clearing it. Held
//! faces are never re-matched; the persistence is purely cosmetic. The
//! single-shot authentication path does not use this.

use crate::config::StabilizerConfig;
use crate::decision::AccessReport;
use crate::types::{AccessOutcome, BoundingBox};

/// BGR colours used to draw the preview box.
pub const COLOR_GRANTED: [u8; 3] = [0, 255, 0];
pub const COLOR_DENIED: [u8; 3] = [0, 165, 255];
pub const COLOR_UNKNOWN: [u8; 3] = [0, 0, 255];

/// What the preview shows for a face.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilizedFace {
    pub bbox: BoundingBox,
    pub label: String,
    /// BGR.
    pub color: [u8; 3],
    pub access: bool,
}

impl StabilizedFace {
    pub fn from_report(bbox: BoundingBox, report: &AccessReport) -> Self {
        let color = match report.outcome {
            AccessOutcome::Granted => COLOR_GRANTED,
            AccessOutcome::RecognizedDenied => COLOR_DENIED,
            AccessOutcome::Unknown => COLOR_UNKNOWN,
        };
        Self {
            bbox,
            label: format!("{} ({:.3})", report.matched_name, report.distance),
            color,
            access: report.outcome == AccessOutcome::Granted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum StabilizerState {
    #[default]
    NoDetection,
    Tracking {
        face: StabilizedFace,
        frames_since_detection: u32,
    },
}

pub struct TemporalStabilizer {
    config: StabilizerConfig,
    frame_count: u64,
    state: StabilizerState,
}

impl TemporalStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config: StabilizerConfig {
                detect_every: config.detect_every.max(1),
                ..config
            },
            frame_count: 0,
            state: StabilizerState::NoDetection,
        }
    }

    pub fn state(&self) -> &StabilizerState {
        &self.state
    }

    /// The face currently on display, if any.
    pub fn current(&self) -> Option<&StabilizedFace> {
        match &self.state {
            StabilizerState::NoDetection => None,
            StabilizerState::Tracking { face, .. } => Some(face),
        }
    }

    /// Whether the next call to [`advance`](Self::advance) will run detection.
    pub fn should_detect(&self) -> bool {
        self.frame_count % u64::from(self.config.detect_every) == 0
    }

    /// Process one frame, in capture order.
    ///
    /// `detect` runs the full detect/embed/match/decide pipeline and is only
    /// invoked on detection frames; on skipped frames the current face is
    /// returned unchanged.
    pub fn advance<E>(
        &mut self,
        detect: impl FnOnce() -> Result<Option<StabilizedFace>, E>,
    ) -> Result<Option<&StabilizedFace>, E> {
        let run = self.should_detect();
        self.frame_count += 1;
        if run {
            let observed = detect()?;
            self.observe(observed);
        }
        Ok(self.current())
    }

    fn observe(&mut self, observed: Option<StabilizedFace>) {
        match observed {
            Some(face) => {
                self.state = StabilizerState::Tracking {
                    face,
                    frames_since_detection: 0,
                };
            }
            None => {
                let expired = match &mut self.state {
                    StabilizerState::NoDetection => false,
                    StabilizerState::Tracking {
                        frames_since_detection,
                        ..
                    } => {
                        *frames_since_detection += 1;
                        *frames_since_detection > self.config.max_missed_frames
                    }
                };
                if expired {
                    tracing::debug!(
                        max_missed = self.config.max_missed_frames,
                        "face lost, clearing preview state"
                    );
                    self.state = StabilizerState::NoDetection;
                }
            }
        }
    }
}
