//! Nearest-identity search over an enrolled-user snapshot.
//!
//! Matching is a linear scan: O(#users) cosine distances per probe, with no
//! index. That is fine for the tens to low hundreds of users a door or desk
//! deployment enrolls; beyond a few thousand users an ANN index would be
//! needed and this module is the place to add it.

use crate::types::{Embedding, MatchResult, UserSnapshot};

/// Cosine distance `1 - cos(a, b)`, in [0, 2]. Lower = more similar.
///
/// Vectors of different length, or with a zero norm, carry no usable
/// direction and get distance 1.0 (orthogonal). The result is clamped to
/// [0, 2] so rounding never yields a negative distance.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let similarity = dot / denom;
    if !(denom > 0.0) || !similarity.is_finite() {
        return 1.0;
    }
    (1.0 - similarity).clamp(0.0, 2.0)
}

/// Strategy for finding the enrolled user nearest to a probe embedding.
pub trait Matcher {
    fn nearest(&self, probe: &Embedding, users: &UserSnapshot) -> MatchResult;
}

/// Cosine-distance matcher.
///
/// Ties keep the earlier user in snapshot order: a later user only replaces
/// the incumbent with a strictly smaller distance.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn nearest(&self, probe: &Embedding, users: &UserSnapshot) -> MatchResult {
        let mut best = MatchResult::no_users();

        for user in users {
            let distance = probe.distance(&user.embedding);
            if best.matched_user.is_none() || distance < best.distance {
                best = MatchResult {
                    matched_user: Some(user.name.clone()),
                    distance,
                    access: user.access,
                };
            }
        }

        tracing::trace!(
            users = users.len(),
            nearest = best.user_name(),
            distance = best.distance,
            "identity match"
        );

        best
    }
}
