//! Authentication and enrollment orchestration.
//!
//! `authenticate` runs extraction, scans the active signatures, applies the
//! matchability and strict thresholds, and records the attempt. Processing
//! failures become an ERROR result instead of propagating to the caller.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::models::{AuthOutcome, AuthResult, EnrollResult, NewAttempt, SignatureCandidate};
use crate::store::{Store, StoreError};
use chrono::Utc;
use facegate_core::{
    EnrolledFace, Extraction, GeometryMatcher, Matcher, Signature, MATCHABILITY_THRESHOLD,
    STRICT_THRESHOLD,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SUCCESS_MESSAGE: &str = "Authentication successful";
pub const NO_FACE_MESSAGE: &str = "No face detected";
pub const UNKNOWN_PERSON_MESSAGE: &str = "Unknown person or low confidence";
pub const LOW_SIMILARITY_REASON: &str = "Low similarity score";
pub const LOW_CONFIDENCE_REASON: &str = "Low confidence score";
pub const ENROLLED_MESSAGE: &str = "Face enrolled successfully";

const SIMULATION_LOCATION: &str = "Prototype Simulator";
const SIMULATE_SUCCESS_THRESHOLD: f64 = 0.75;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("employee {0} not found or inactive")]
    EmployeeNotFound(i64),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-channel policy knobs.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub device_location: String,
    pub detect_timeout: Duration,
    pub audit_unknown_person: bool,
}

impl From<&Config> for AuthSettings {
    fn from(config: &Config) -> Self {
        Self {
            device_location: config.device_location.clone(),
            detect_timeout: config.detect_timeout,
            audit_unknown_person: config.audit_unknown_person,
        }
    }
}

pub struct Authenticator {
    engine: EngineHandle,
    store: Store,
    settings: AuthSettings,
    rng: Mutex<StdRng>,
}

impl Authenticator {
    pub fn new(engine: EngineHandle, store: Store, settings: AuthSettings, rng: StdRng) -> Self {
        Self {
            engine,
            store,
            settings,
            rng: Mutex::new(rng),
        }
    }

    pub fn algorithm(&self) -> &str {
        self.engine.algorithm()
    }

    /// Authenticate whoever is in `image` against every enrolled employee.
    pub async fn authenticate(&self, image: String) -> AuthResult {
        let started = Instant::now();
        match self.run_authenticate(image, started).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "authentication aborted");
                AuthResult::error(format!("Authentication error: {err}"), elapsed_ms(started))
            }
        }
    }

    async fn run_authenticate(&self, image: String, started: Instant) -> Result<AuthResult, AuthError> {
        let probe = match self.engine.extract(image, self.settings.detect_timeout).await? {
            Extraction::Face(signature) => signature,
            Extraction::NoFaceDetected => {
                tracing::info!("authenticate: no face detected");
                return Ok(AuthResult::failed(NO_FACE_MESSAGE, 0.0, elapsed_ms(started)));
            }
        };

        let candidates = self.store.active_signatures().await?;
        let gallery = decode_gallery(&candidates);
        let matched = GeometryMatcher.compare(&probe, &gallery, MATCHABILITY_THRESHOLD);

        let Some(candidate) = matched
            .employee_id
            .filter(|_| matched.matched)
            .and_then(|id| candidates.iter().find(|c| c.employee_id == id))
        else {
            let processing_time_ms = elapsed_ms(started);
            if self.settings.audit_unknown_person {
                self.store
                    .record_attempt(NewAttempt {
                        employee_id: None,
                        result: AuthOutcome::Failed,
                        confidence_score: 0.0,
                        failure_reason: Some(UNKNOWN_PERSON_MESSAGE.to_string()),
                        device_location: self.settings.device_location.clone(),
                        processing_time_ms,
                        attempt_timestamp: Utc::now(),
                    })
                    .await?;
            }
            tracing::info!(
                closest = matched.closest,
                candidates = gallery.len(),
                audited = self.settings.audit_unknown_person,
                "authenticate: unknown person"
            );
            return Ok(AuthResult::failed(UNKNOWN_PERSON_MESSAGE, 0.0, processing_time_ms));
        };

        let similarity = round_to(matched.similarity, 3);
        let outcome = if matched.similarity > STRICT_THRESHOLD {
            AuthOutcome::Success
        } else {
            AuthOutcome::Failed
        };
        let processing_time_ms = elapsed_ms(started);

        let attempt = self
            .store
            .record_attempt(NewAttempt {
                employee_id: Some(candidate.employee_id),
                result: outcome,
                confidence_score: similarity,
                failure_reason: (outcome == AuthOutcome::Failed)
                    .then(|| LOW_SIMILARITY_REASON.to_string()),
                device_location: self.settings.device_location.clone(),
                processing_time_ms,
                attempt_timestamp: Utc::now(),
            })
            .await?;

        tracing::info!(
            employee_id = candidate.employee_id,
            similarity,
            outcome = outcome.as_str(),
            log_id = attempt.log_id,
            "authenticate: decision recorded"
        );

        Ok(AuthResult {
            outcome,
            message: match outcome {
                AuthOutcome::Success => SUCCESS_MESSAGE.to_string(),
                _ => LOW_SIMILARITY_REASON.to_string(),
            },
            employee_id: Some(candidate.employee_id),
            employee_name: Some(candidate.employee_name.clone()),
            role: Some(candidate.role_name.clone()),
            confidence: similarity,
            processing_time_ms,
            timestamp: attempt.attempt_timestamp,
        })
    }

    /// Demo path without imagery: draw a confidence and decide on it.
    ///
    /// Always writes exactly one attempt; stamps `last_login` only on SUCCESS.
    pub async fn simulate(&self, employee_id: i64) -> Result<AuthResult, AuthError> {
        let employee = self
            .store
            .get_active_employee(employee_id)
            .await?
            .ok_or(AuthError::EmployeeNotFound(employee_id))?;
        let role = self.store.get_role(&employee).await?;

        let (confidence, processing_time_ms) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (round_to(rng.gen_range(0.60..=0.95), 2), rng.gen_range(800..=1800i64))
        };
        let outcome = if confidence > SIMULATE_SUCCESS_THRESHOLD {
            AuthOutcome::Success
        } else {
            AuthOutcome::Failed
        };

        let attempt = self
            .store
            .record_attempt(NewAttempt {
                employee_id: Some(employee_id),
                result: outcome,
                confidence_score: confidence,
                failure_reason: (outcome == AuthOutcome::Failed)
                    .then(|| LOW_CONFIDENCE_REASON.to_string()),
                device_location: SIMULATION_LOCATION.to_string(),
                processing_time_ms,
                attempt_timestamp: Utc::now(),
            })
            .await
            .map_err(employee_gone(employee_id))?;

        tracing::info!(
            employee_id,
            confidence,
            outcome = outcome.as_str(),
            "simulate: attempt recorded"
        );

        Ok(AuthResult {
            outcome,
            message: match outcome {
                AuthOutcome::Success => SUCCESS_MESSAGE.to_string(),
                _ => LOW_CONFIDENCE_REASON.to_string(),
            },
            employee_id: Some(employee_id),
            employee_name: Some(employee.full_name()),
            role: Some(role.role_name),
            confidence,
            processing_time_ms,
            timestamp: attempt.attempt_timestamp,
        })
    }

    /// Enroll (or re-enroll) the face in `image` for `employee_id`.
    pub async fn enroll(&self, employee_id: i64, image: String) -> Result<EnrollResult, AuthError> {
        if self.store.get_active_employee(employee_id).await?.is_none() {
            return Err(AuthError::EmployeeNotFound(employee_id));
        }

        let signature = match self.engine.extract(image, self.settings.detect_timeout).await {
            Ok(Extraction::Face(signature)) => signature,
            Ok(Extraction::NoFaceDetected) => {
                tracing::info!(employee_id, "enroll: no face detected");
                return Ok(EnrollResult::rejected(NO_FACE_MESSAGE));
            }
            Err(err) => {
                tracing::error!(employee_id, error = %err, "enroll: extraction failed");
                return Ok(EnrollResult::rejected(format!("Enrollment error: {err}")));
            }
        };

        let record = self
            .store
            .upsert_signature(employee_id, signature, self.engine.algorithm().to_string())
            .await
            .map_err(employee_gone(employee_id))?;

        Ok(EnrollResult {
            success: true,
            message: ENROLLED_MESSAGE.to_string(),
            confidence: Some(record.confidence_score),
        })
    }
}

/// Decode stored signatures, skipping any that fail the schema.
fn decode_gallery(candidates: &[SignatureCandidate]) -> Vec<EnrolledFace> {
    candidates
        .iter()
        .filter_map(|c| match Signature::from_json(&c.face_encoding) {
            Ok(signature) => Some(EnrolledFace {
                employee_id: c.employee_id,
                signature,
            }),
            Err(err) => {
                tracing::warn!(employee_id = c.employee_id, error = %err, "skipping stored signature");
                None
            }
        })
        .collect()
}

fn employee_gone(employee_id: i64) -> impl FnOnce(StoreError) -> AuthError {
    move |err| match err {
        StoreError::NotFound { entity: "employee", .. } => AuthError::EmployeeNotFound(employee_id),
        other => AuthError::Store(other),
    }
}

/// Round half away from zero to `places` decimals.
fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{fixture_payload, FailingDetector, StubDetector};
    use crate::models::{Employee, NewRole};
    use crate::store::tests::{new_employee, seeded_store};
    use facegate_core::FaceDetector;
    use rand::SeedableRng;

    const PROBE: Signature = Signature { x: 0.25, y: 0.125, width: 0.5, height: 0.5, confidence: 0.75 };

    fn settings(audit_unknown_person: bool) -> AuthSettings {
        AuthSettings {
            device_location: "Main Entrance".into(),
            detect_timeout: Duration::from_secs(10),
            audit_unknown_person,
        }
    }

    fn authenticator_with(detector: impl FaceDetector + 'static, store: &Store, audit: bool) -> Authenticator {
        let engine = spawn_engine(detector).unwrap();
        Authenticator::new(engine, store.clone(), settings(audit), StdRng::seed_from_u64(7))
    }

    async fn harness(audit: bool) -> (Authenticator, Store, Employee) {
        let (store, employee) = seeded_store().await;
        let auth = authenticator_with(StubDetector::for_signature(PROBE), &store, audit);
        (auth, store, employee)
    }

    #[tokio::test]
    async fn test_no_face_is_failed_and_not_audited() {
        let (store, _) = seeded_store().await;
        let auth = authenticator_with(StubDetector::returning(vec![]), &store, true);

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Failed);
        assert_eq!(result.message, NO_FACE_MESSAGE);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(store.attempt_summary().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_identical_signature_succeeds() {
        let (auth, store, employee) = harness(false).await;
        let enrolled = auth.enroll(employee.employee_id, fixture_payload()).await.unwrap();
        assert!(enrolled.success);

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Success);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.employee_id, Some(employee.employee_id));
        assert_eq!(result.employee_name.as_deref(), Some("Grace Hopper"));
        assert_eq!(result.role.as_deref(), Some("Engineer"));

        let log = store.recent_attempts(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AuthOutcome::Success);
        assert_eq!(log[0].employee_id, Some(employee.employee_id));
        assert_eq!(log[0].device_location, "Main Entrance");
        assert!(log[0].failure_reason.is_none());

        let reloaded = store.get_active_employee(employee.employee_id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_login, Some(log[0].attempt_timestamp));
    }

    #[tokio::test]
    async fn test_between_thresholds_is_failed_and_audited() {
        let (auth, store, employee) = harness(false).await;
        let enrolled = Signature { x: 0.375, ..PROBE };
        store
            .upsert_signature(employee.employee_id, enrolled, "test".into())
            .await
            .unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Failed);
        assert_eq!(result.message, LOW_SIMILARITY_REASON);
        assert_eq!(result.confidence, 0.75);
        assert_eq!(result.employee_id, Some(employee.employee_id));
        assert_eq!(result.employee_name.as_deref(), Some("Grace Hopper"));
        assert_eq!(result.role.as_deref(), Some("Engineer"));

        let log = store.recent_attempts(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AuthOutcome::Failed);
        assert_eq!(log[0].employee_id, Some(employee.employee_id));
        assert_eq!(log[0].failure_reason.as_deref(), Some(LOW_SIMILARITY_REASON));
        assert_eq!(result.timestamp, log[0].attempt_timestamp);

        let reloaded = store.get_active_employee(employee.employee_id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_login, None);
    }

    #[tokio::test]
    async fn test_unknown_person_not_audited_by_default() {
        let (auth, store, employee) = harness(false).await;
        // similarity 0.5: below matchability
        let far = Signature { x: 0.5, ..PROBE };
        store.upsert_signature(employee.employee_id, far, "test".into()).await.unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Failed);
        assert_eq!(result.message, UNKNOWN_PERSON_MESSAGE);
        assert_eq!(result.confidence, 0.0);
        assert!(result.employee_id.is_none());
        assert_eq!(store.attempt_summary().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_unknown_person_audited_when_enabled() {
        let (auth, store, employee) = harness(true).await;
        // similarity 0.625: close, but never reported
        let near_miss = Signature { x: 0.4375, ..PROBE };
        store.upsert_signature(employee.employee_id, near_miss, "test".into()).await.unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.message, UNKNOWN_PERSON_MESSAGE);
        assert_eq!(result.confidence, 0.0);

        let log = store.recent_attempts(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].employee_id, None);
        assert_eq!(log[0].result, AuthOutcome::Failed);
        assert_eq!(log[0].confidence_score, 0.0);
        assert_eq!(log[0].failure_reason.as_deref(), Some(UNKNOWN_PERSON_MESSAGE));
    }

    #[tokio::test]
    async fn test_malformed_signature_is_skipped() {
        let (auth, store, corrupted) = harness(false).await;
        let other = store
            .create_employee(new_employee(corrupted.role_id, "alan@example.com"))
            .await
            .unwrap();
        store
            .insert_raw_signature(corrupted.employee_id, "{'x': 0.25, 'y': 0.125}")
            .await
            .unwrap();
        store.upsert_signature(other.employee_id, PROBE, "test".into()).await.unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Success);
        assert_eq!(result.employee_id, Some(other.employee_id));
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_only_malformed_signatures_is_unknown() {
        let (auth, store, employee) = harness(false).await;
        store.insert_raw_signature(employee.employee_id, "not json").await.unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Failed);
        assert_eq!(result.message, UNKNOWN_PERSON_MESSAGE);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_deactivated_employee_never_matches() {
        let (auth, store, employee) = harness(false).await;
        store.upsert_signature(employee.employee_id, PROBE, "test".into()).await.unwrap();
        store.set_employee_active(employee.employee_id, false).await.unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.message, UNKNOWN_PERSON_MESSAGE);
        assert!(result.employee_id.is_none());
    }

    #[tokio::test]
    async fn test_bad_payload_is_error_outcome() {
        let (auth, store, employee) = harness(true).await;
        store.upsert_signature(employee.employee_id, PROBE, "test".into()).await.unwrap();

        let result = auth.authenticate("data:image/png;base64,***".to_string()).await;
        assert_eq!(result.outcome, AuthOutcome::Error);
        assert_eq!(result.confidence, 0.0);
        assert!(result.message.contains("base64"), "message: {}", result.message);
        assert_eq!(store.attempt_summary().await.unwrap().total, 0);

        // A later valid attempt is unaffected.
        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Success);
    }

    #[tokio::test]
    async fn test_detector_failure_is_error_outcome() {
        let (store, _) = seeded_store().await;
        let auth = authenticator_with(FailingDetector, &store, true);

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Error);
        assert_eq!(result.confidence, 0.0);
        assert!(result.employee_id.is_none());
    }

    #[tokio::test]
    async fn test_simulate_one_entry_per_call() {
        let (auth, store, employee) = harness(false).await;
        let id = employee.employee_id;

        for call in 1..=25 {
            let before = store.get_active_employee(id).await.unwrap().unwrap().last_login;
            let result = auth.simulate(id).await.unwrap();
            let after = store.get_active_employee(id).await.unwrap().unwrap().last_login;

            assert!((0.60..=0.95).contains(&result.confidence));
            assert_eq!(round_to(result.confidence, 2), result.confidence);
            assert!((800..=1800).contains(&result.processing_time_ms));
            assert_eq!(
                result.outcome == AuthOutcome::Success,
                result.confidence > SIMULATE_SUCCESS_THRESHOLD
            );
            if result.outcome == AuthOutcome::Success {
                assert_eq!(after, Some(result.timestamp));
            } else {
                assert_eq!(after, before);
            }
            assert_eq!(store.attempt_summary().await.unwrap().total, call);
        }

        let log = store.recent_attempts(1).await.unwrap();
        assert_eq!(log[0].device_location, SIMULATION_LOCATION);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.7549, 2), 0.75);
        assert_eq!(round_to(0.7551, 2), 0.76);
        assert_eq!(round_to(0.93749, 3), 0.937);
        assert_eq!(round_to(1.0, 3), 1.0);
    }

    #[tokio::test]
    async fn test_simulate_decides_on_rounded_confidence() {
        let (auth, store, employee) = harness(false).await;
        for _ in 0..40 {
            let result = auth.simulate(employee.employee_id).await.unwrap();
            let log = store.recent_attempts(1).await.unwrap();
            assert_eq!(log[0].confidence_score, result.confidence);
            // a reported 0.75 is never a success
            if result.confidence <= SIMULATE_SUCCESS_THRESHOLD {
                assert_eq!(result.outcome, AuthOutcome::Failed);
                assert_eq!(result.message, LOW_CONFIDENCE_REASON);
            } else {
                assert_eq!(result.outcome, AuthOutcome::Success);
            }
        }
    }

    #[tokio::test]
    async fn test_simulate_is_deterministic_with_seed() {
        let (store, employee) = seeded_store().await;
        let a = authenticator_with(StubDetector::returning(vec![]), &store, false);
        let b = authenticator_with(StubDetector::returning(vec![]), &store, false);
        for _ in 0..5 {
            let ra = a.simulate(employee.employee_id).await.unwrap();
            let rb = b.simulate(employee.employee_id).await.unwrap();
            assert_eq!(ra.confidence, rb.confidence);
            assert_eq!(ra.processing_time_ms, rb.processing_time_ms);
        }
    }

    #[tokio::test]
    async fn test_simulate_unknown_employee() {
        let (auth, store, _) = harness(false).await;
        let err = auth.simulate(9999).await.unwrap_err();
        assert!(matches!(err, AuthError::EmployeeNotFound(9999)));
        assert_eq!(store.attempt_summary().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_enroll_twice_second_wins() {
        let (first, store, employee) = harness(false).await;
        let moved = Signature { x: 0.5, y: 0.25, width: 0.25, height: 0.25, confidence: 0.5 };
        let second = authenticator_with(StubDetector::for_signature(moved), &store, false);

        assert!(first.enroll(employee.employee_id, fixture_payload()).await.unwrap().success);
        let result = second.enroll(employee.employee_id, fixture_payload()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.confidence, Some(0.5));

        let active = store.active_signatures().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(Signature::from_json(&active[0].face_encoding).unwrap(), moved);

        let record = store.active_signature(employee.employee_id).await.unwrap().unwrap();
        assert_eq!(record.algorithm_version, "stub/bbox-v1");
    }

    #[tokio::test]
    async fn test_enroll_no_face_leaves_store_untouched() {
        let (store, employee) = seeded_store().await;
        let auth = authenticator_with(StubDetector::returning(vec![]), &store, false);

        let result = auth.enroll(employee.employee_id, fixture_payload()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, NO_FACE_MESSAGE);
        assert!(result.confidence.is_none());
        assert!(store.active_signature(employee.employee_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enroll_unknown_or_inactive_employee() {
        let (auth, store, employee) = harness(false).await;
        assert!(matches!(
            auth.enroll(4242, fixture_payload()).await,
            Err(AuthError::EmployeeNotFound(4242))
        ));

        store.set_employee_active(employee.employee_id, false).await.unwrap();
        assert!(matches!(
            auth.enroll(employee.employee_id, fixture_payload()).await,
            Err(AuthError::EmployeeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_best_of_several_employees() {
        let (auth, store, near) = harness(false).await;
        let role = store.create_role(NewRole::new("Visitor", 1)).await.unwrap();
        let nearer = store
            .create_employee(new_employee(role.role_id, "nearer@example.com"))
            .await
            .unwrap();
        // 0.875 and 0.9375: both matchable, the second wins
        store
            .upsert_signature(near.employee_id, Signature { x: 0.3125, ..PROBE }, "t".into())
            .await
            .unwrap();
        store
            .upsert_signature(nearer.employee_id, Signature { x: 0.28125, ..PROBE }, "t".into())
            .await
            .unwrap();

        let result = auth.authenticate(fixture_payload()).await;
        assert_eq!(result.outcome, AuthOutcome::Success);
        assert_eq!(result.employee_id, Some(nearer.employee_id));
        assert_eq!(result.role.as_deref(), Some("Visitor"));
        // 0.9375 reported to three decimals
        assert_eq!(result.confidence, 0.938);
    }
}
