use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name reported when no enrolled user is close enough (or none exist).
pub const UNKNOWN_USER: &str = "unknown";

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid BGR length for {width}x{height}: expected {expected}, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("frame has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// A captured colour frame, 3 interleaved channels in BGR order, row-major.
#[derive(Clone)]
pub struct Frame {
    /// Pixel data (width * height * 3 bytes, B, G, R per pixel).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    /// Wrap a BGR buffer, checking that it covers the full raster.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    /// Builder-style sequence number, used by capture code.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Convert to an RGB image (channel swap only).
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        // Length was validated at construction.
        image::RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| image::RgbImage::new(self.width, self.height))
    }
}

/// Face rectangle in original-frame pixel coordinates.
///
/// Always satisfies `x1 < x2 <= width` and `y1 < y2 <= height` for the
/// frame it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// The single best face found in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Model confidence in [0, 1].
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for ArcFace R100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine distance to `other`; see [`crate::matcher::cosine_distance`].
    pub fn distance(&self, other: &Embedding) -> f32 {
        crate::matcher::cosine_distance(&self.values, &other.values)
    }
}

/// An enrolled identity as read from the user store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledUser {
    pub name: String,
    pub embedding: Embedding,
    pub access: bool,
}

/// Read-only view of the enrolled users for one matching pass.
///
/// Iteration order is the store's order and decides ties in matching.
/// A snapshot never changes; callers build a new one after any enroll,
/// toggle or removal.
#[derive(Debug, Clone, Default)]
pub struct UserSnapshot {
    users: Vec<EnrolledUser>,
}

impl UserSnapshot {
    pub fn new(users: Vec<EnrolledUser>) -> Self {
        Self { users }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EnrolledUser> {
        self.users.iter()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl<'a> IntoIterator for &'a UserSnapshot {
    type Item = &'a EnrolledUser;
    type IntoIter = std::slice::Iter<'a, EnrolledUser>;

    fn into_iter(self) -> Self::IntoIter {
        self.users.iter()
    }
}

/// Nearest enrolled user for a live embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Nearest user's name, `None` when the snapshot was empty.
    pub matched_user: Option<String>,
    /// Cosine distance to that user, `f32::INFINITY` when the snapshot was empty.
    pub distance: f32,
    /// The nearest user's access flag (false when empty).
    pub access: bool,
}

impl MatchResult {
    /// Result for an empty snapshot.
    pub fn no_users() -> Self {
        Self {
            matched_user: None,
            distance: f32::INFINITY,
            access: false,
        }
    }

    /// The matched name, or [`UNKNOWN_USER`].
    pub fn user_name(&self) -> &str {
        self.matched_user.as_deref().unwrap_or(UNKNOWN_USER)
    }
}

/// Final access decision for one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Granted,
    RecognizedDenied,
    Unknown,
}

impl AccessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOutcome::Granted => "granted",
            AccessOutcome::RecognizedDenied => "recognized_denied",
            AccessOutcome::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_bgr_validates_length() {
        assert!(Frame::from_bgr(vec![0u8; 2 * 2 * 3], 2, 2).is_ok());
        let err = Frame::from_bgr(vec![0u8; 11], 2, 2).err();
        assert!(matches!(
            err,
            Some(FrameError::InvalidLength { expected: 12, actual: 11, .. })
        ));
    }

    #[test]
    fn test_frame_rejects_zero_area() {
        assert!(matches!(
            Frame::from_bgr(vec![], 0, 4),
            Err(FrameError::Empty { .. })
        ));
    }

    #[test]
    fn test_to_rgb_image_swaps_channels() {
        // One pixel: B=10, G=20, R=30
        let frame = Frame::from_bgr(vec![10, 20, 30], 1, 1).unwrap();
        let rgb = frame.to_rgb_image();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_bounding_box_dimensions() {
        let b = BoundingBox { x1: 10, y1: 20, x2: 70, y2: 100 };
        assert_eq!(b.width(), 60);
        assert_eq!(b.height(), 80);
    }

    #[test]
    fn test_snapshot_keeps_store_order() {
        let snap = UserSnapshot::new(vec![
            EnrolledUser { name: "ana".into(), embedding: Embedding::new(vec![1.0]), access: true },
            EnrolledUser { name: "luis".into(), embedding: Embedding::new(vec![0.5]), access: false },
        ]);
        assert_eq!(snap.len(), 2);
        let names: Vec<&str> = snap.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["ana", "luis"]);
    }

    #[test]
    fn test_no_users_match_result() {
        let r = MatchResult::no_users();
        assert_eq!(r.user_name(), UNKNOWN_USER);
        assert!(r.distance.is_infinite());
        assert!(!r.access);
    }
}
