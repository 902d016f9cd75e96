//! Access decision from a match result.

use crate::config::MatchingConfig;
use crate::types::{AccessOutcome, MatchResult, UNKNOWN_USER};
use serde::Serialize;

/// Fixed-threshold access policy.
#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    /// Distances strictly below this are a recognized identity.
    pub distance_threshold: f32,
}

impl AccessPolicy {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            distance_threshold: config.distance_threshold,
        }
    }

    /// `distance < threshold` is required for anything but Unknown; the
    /// access flag then separates Granted from RecognizedDenied.
    pub fn decide(&self, result: &MatchResult) -> AccessOutcome {
        if result.distance < self.distance_threshold {
            if result.access {
                AccessOutcome::Granted
            } else {
                AccessOutcome::RecognizedDenied
            }
        } else {
            AccessOutcome::Unknown
        }
    }
}

/// Structured outcome of one authentication, ready for any caller to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessReport {
    pub outcome: AccessOutcome,
    /// Recognized name, or "unknown". The nearest name of an Unknown outcome
    /// is never surfaced as an identity.
    pub matched_name: String,
    /// Distance to the nearest user (infinite with no users enrolled).
    pub distance: f32,
}

impl AccessReport {
    pub fn from_match(policy: &AccessPolicy, result: &MatchResult) -> Self {
        let outcome = policy.decide(result);
        let matched_name = match outcome {
            AccessOutcome::Unknown => UNKNOWN_USER.to_string(),
            _ => result.user_name().to_string(),
        };
        Self {
            outcome,
            matched_name,
            distance: result.distance,
        }
    }

    /// Default user-facing message.
    pub fn message(&self) -> String {
        match self.outcome {
            AccessOutcome::Granted => format!("Welcome, {}!", self.matched_name),
            AccessOutcome::RecognizedDenied => format!(
                "User {} recognized, but access is not authorized.",
                self.matched_name
            ),
            AccessOutcome::Unknown => "Face not recognized. Access denied.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy::new(&MatchingConfig::default())
    }

    fn result(distance: f32, access: bool) -> MatchResult {
        MatchResult { matched_user: Some("ana".into()), distance, access }
    }

    #[test]
    fn test_truth_table() {
        let p = policy();
        assert_eq!(p.decide(&result(0.3, true)), AccessOutcome::Granted);
        assert_eq!(p.decide(&result(0.3, false)), AccessOutcome::RecognizedDenied);
        assert_eq!(p.decide(&result(0.7, true)), AccessOutcome::Unknown);
        assert_eq!(p.decide(&result(0.7, false)), AccessOutcome::Unknown);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let p = policy();
        assert_eq!(p.decide(&result(0.55, true)), AccessOutcome::Unknown);
        assert_eq!(p.decide(&result(0.5499, true)), AccessOutcome::Granted);
    }

    #[test]
    fn test_empty_store_is_unknown() {
        assert_eq!(policy().decide(&MatchResult::no_users()), AccessOutcome::Unknown);
    }

    #[test]
    fn test_report_hides_name_when_unknown() {
        let report = AccessReport::from_match(&policy(), &result(0.9, true));
        assert_eq!(report.outcome, AccessOutcome::Unknown);
        assert_eq!(report.matched_name, "unknown");
        assert!((report.distance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_report_messages() {
        let granted = AccessReport::from_match(&policy(), &result(0.1, true));
        assert_eq!(granted.message(), "Welcome, ana!");
        let denied = AccessReport::from_match(&policy(), &result(0.1, false));
        assert!(denied.message().contains("ana"));
        assert_eq!(denied.matched_name, "ana");
    }

    #[test]
    fn test_report_serializes_outcome_snake_case() {
        let report = AccessReport::from_match(&policy(), &result(0.1, false));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "recognized_denied");
        assert_eq!(json["matched_name"], "ana");
    }
}
