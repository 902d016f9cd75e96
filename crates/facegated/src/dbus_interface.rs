use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use facegate_core::{AccessOutcome, AuthenticationOutcome, EnrollmentOutcome, UserSnapshot};
use facegate_store::{StoreError, UserStore};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock};
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Facegate1";
pub const OBJECT_PATH: &str = "/org/facegate/Facegate1";

/// D-Bus interface for the access-control daemon.
///
/// Authentication matches against a cached snapshot of enrolled users. The
/// snapshot is replaced after every admin mutation, so an authentication
/// already in flight keeps the list it started with.
pub struct FacegateService {
    engine: EngineHandle,
    store: Mutex<UserStore>,
    snapshot: RwLock<Arc<UserSnapshot>>,
    config: Config,
}

impl FacegateService {
    pub fn new(engine: EngineHandle, store: UserStore, snapshot: UserSnapshot, config: Config) -> Self {
        Self {
            engine,
            store: Mutex::new(store),
            snapshot: RwLock::new(Arc::new(snapshot)),
            config,
        }
    }

    fn snapshot(&self) -> Arc<UserSnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Run `f` against the store. Never held across an await.
    fn with_store<T>(
        &self,
        f: impl FnOnce(&UserStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        f(&store)
    }

    /// Reload enrolled users from the store into the cached snapshot.
    fn refresh_snapshot(&self) -> Result<(), StoreError> {
        let fresh = self.with_store(|s| s.list_enrolled_users())?;
        tracing::debug!(users = fresh.len(), "user snapshot refreshed");
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(fresh);
        Ok(())
    }
}

fn engine_err(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn store_err(e: StoreError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateService {
    /// Sample frames from the camera and decide on the best match.
    ///
    /// Returns a JSON object: success, outcome, matched_name, distance, message.
    async fn authenticate(&self) -> zbus::fdo::Result<String> {
        let users = self.snapshot();
        tracing::info!(users = users.len(), "authenticate requested");

        let outcome = self
            .engine
            .authenticate(users, self.config.auth_attempts)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "authentication failed");
                engine_err(e)
            })?;
        Ok(authentication_response(&outcome).to_string())
    }

    /// Capture a face and register it under `name`.
    ///
    /// Name problems are reported before the camera is touched. New users
    /// receive access only when auto_grant_access is configured.
    async fn register(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user = name, "register requested");

        let name = match self.with_store(|s| precheck_name(s, name)).map_err(store_err)? {
            NameCheck::Available(name) => name,
            NameCheck::Rejected(reply) => return Ok(reply.to_string()),
        };

        let capture = match self
            .engine
            .enroll(self.config.enroll_attempts)
            .await
            .map_err(engine_err)?
        {
            EnrollmentOutcome::Captured(c) => c,
            EnrollmentOutcome::NoFaceDetected => {
                tracing::warn!(user = %name, "register: no face detected");
                return Ok(failure_response(
                    "no_face_detected",
                    "No face detected. Make sure your face is visible to the camera.",
                )
                .to_string());
            }
        };

        let access = self.config.auto_grant_access;
        let stored = match self.with_store(|s| s.enroll_user(&name, &capture.embedding, access)) {
            Ok(user) => user,
            // Lost a race with a concurrent registration of the same name.
            Err(e @ StoreError::NameConflict(_)) => {
                return Ok(failure_response("name_conflict", &e.to_string()).to_string());
            }
            Err(e) => return Err(store_err(e)),
        };
        self.refresh_snapshot().map_err(store_err)?;

        Ok(json!({
            "success": true,
            "name": stored.name,
            "access": stored.access,
            "confidence": capture.confidence,
            "message": format!("User {} registered.", stored.name),
        })
        .to_string())
    }

    /// JSON array of registered users (id, name, access, created_at).
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.with_store(|s| s.list_users()).map_err(store_err)?;
        serde_json::to_string(&users).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Flip a user's access flag; returns the new value.
    async fn toggle_access(&self, name: &str) -> zbus::fdo::Result<bool> {
        let access = self.with_store(|s| s.toggle_access(name)).map_err(store_err)?;
        tracing::info!(user = name, access, "access toggled");
        self.refresh_snapshot().map_err(store_err)?;
        Ok(access)
    }

    /// Delete a user. Returns false when no such user exists.
    async fn remove_user(&self, name: &str) -> zbus::fdo::Result<bool> {
        match self.with_store(|s| s.remove_user(name)) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(store_err(e)),
        }
        tracing::info!(user = name, "user removed");
        self.refresh_snapshot().map_err(store_err)?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let cam = &self.engine.camera;
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": cam.device,
            "resolution": format!("{}x{}", cam.width, cam.height),
            "models_loaded": true,
            "users_enrolled": self.snapshot().len(),
            "match_threshold": self.config.pipeline.matching.distance_threshold,
            "auto_grant_access": self.config.auto_grant_access,
        })
        .to_string())
    }
}

enum NameCheck {
    /// Trimmed name, free to register.
    Available(String),
    /// Reply to send back without touching the camera.
    Rejected(Value),
}

/// Reject empty or already registered names.
fn precheck_name(store: &UserStore, name: &str) -> Result<NameCheck, StoreError> {
    let name = match facegate_store::validate_name(name) {
        Ok(n) => n.to_string(),
        Err(e) => {
            return Ok(NameCheck::Rejected(failure_response("invalid_name", &e.to_string())));
        }
    };
    if store.contains(&name)? {
        let e = StoreError::NameConflict(name);
        return Ok(NameCheck::Rejected(failure_response("name_conflict", &e.to_string())));
    }
    Ok(NameCheck::Available(name))
}

fn failure_response(outcome: &str, message: &str) -> Value {
    json!({
        "success": false,
        "outcome": outcome,
        "message": message,
    })
}

/// JSON body of an Authenticate reply.
fn authentication_response(outcome: &AuthenticationOutcome) -> Value {
    match outcome {
        AuthenticationOutcome::NoFaceDetected => failure_response(
            "no_face_detected",
            "No face detected. Look at the camera and try again.",
        ),
        AuthenticationOutcome::Decided(analysis) => {
            let report = &analysis.report;
            json!({
                "success": report.outcome == AccessOutcome::Granted,
                "outcome": report.outcome,
                "matched_name": report.matched_name,
                // Non-finite (no users enrolled) serializes as null.
                "distance": report.distance,
                "message": report.message(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{
        AccessPolicy, AccessReport, BoundingBox, Detection, Embedding, FrameAnalysis, MatchResult,
    };

    fn decided(result: MatchResult) -> AuthenticationOutcome {
        let policy = AccessPolicy {
            distance_threshold: 0.55,
        };
        let report = AccessReport::from_match(&policy, &result);
        AuthenticationOutcome::Decided(FrameAnalysis {
            detection: Detection {
                bbox: BoundingBox {
                    x1: 0,
                    y1: 0,
                    x2: 100,
                    y2: 100,
                },
                confidence: 0.9,
            },
            matched: result,
            report,
        })
    }

    fn store_with(names: &[&str]) -> UserStore {
        let store = UserStore::open_in_memory().unwrap();
        for name in names {
            store
                .enroll_user(name, &Embedding::new(vec![1.0, 0.0, 0.0]), true)
                .unwrap();
        }
        store
    }

    #[test]
    fn test_precheck_accepts_new_name_trimmed() {
        let store = store_with(&["ana"]);
        match precheck_name(&store, "  bob ").unwrap() {
            NameCheck::Available(name) => assert_eq!(name, "bob"),
            NameCheck::Rejected(v) => panic!("unexpected rejection: {v}"),
        }
    }

    #[test]
    fn test_precheck_rejects_empty_and_taken_names() {
        let store = store_with(&["ana"]);
        for (name, outcome) in [("", "invalid_name"), ("   ", "invalid_name"), (" ana ", "name_conflict")] {
            match precheck_name(&store, name).unwrap() {
                NameCheck::Rejected(v) => {
                    assert_eq!(v["success"], false);
                    assert_eq!(v["outcome"], outcome, "name {name:?}");
                }
                NameCheck::Available(n) => panic!("{n:?} should be rejected"),
            }
        }
    }

    #[tokio::test]
    async fn test_register_rejects_bad_names_without_engine_work() {
        let (engine, mut requests) = EngineHandle::detached();
        let service = FacegateService::new(
            engine,
            store_with(&["ana"]),
            UserSnapshot::default(),
            Config::default(),
        );

        let reply: Value = serde_json::from_str(&service.register("").await.unwrap()).unwrap();
        assert_eq!(reply["outcome"], "invalid_name");
        let reply: Value = serde_json::from_str(&service.register("ana").await.unwrap()).unwrap();
        assert_eq!(reply["outcome"], "name_conflict");

        assert!(requests.try_recv().is_err(), "no capture may be requested");
    }

    #[test]
    fn test_granted_response() {
        let v = authentication_response(&decided(MatchResult {
            matched_user: Some("alice".into()),
            distance: 0.2,
            access: true,
        }));
        assert_eq!(v["success"], true);
        assert_eq!(v["outcome"], "granted");
        assert_eq!(v["matched_name"], "alice");
        assert_eq!(v["message"], "Welcome, alice!");
    }

    #[test]
    fn test_recognized_denied_response() {
        let v = authentication_response(&decided(MatchResult {
            matched_user: Some("bob".into()),
            distance: 0.3,
            access: false,
        }));
        assert_eq!(v["success"], false);
        assert_eq!(v["outcome"], "recognized_denied");
        assert_eq!(v["matched_name"], "bob");
    }

    #[test]
    fn test_unknown_hides_nearest_name() {
        let v = authentication_response(&decided(MatchResult {
            matched_user: Some("alice".into()),
            distance: 0.8,
            access: true,
        }));
        assert_eq!(v["success"], false);
        assert_eq!(v["outcome"], "unknown");
        assert_eq!(v["matched_name"], "unknown");
    }

    #[test]
    fn test_empty_snapshot_distance_is_null() {
        let v = authentication_response(&decided(MatchResult::no_users()));
        assert_eq!(v["outcome"], "unknown");
        assert!(v["distance"].is_null());
    }

    #[test]
    fn test_no_face_response() {
        let v = authentication_response(&AuthenticationOutcome::NoFaceDetected);
        assert_eq!(v["success"], false);
        assert_eq!(v["outcome"], "no_face_detected");
        assert!(v.get("matched_name").is_none());
    }
}
