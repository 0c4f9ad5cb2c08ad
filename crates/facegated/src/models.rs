//! Records persisted by the store and results returned to callers.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Security policy attached to employees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: i64,
    pub role_name: String,
    pub description: Option<String>,
    pub security_level: i32,
    pub max_attempts: i32,
    pub can_enroll_others: bool,
}

#[derive(Debug, Clone)]
pub struct NewRole {
    pub role_name: String,
    pub description: Option<String>,
    pub security_level: i32,
    pub max_attempts: i32,
    pub can_enroll_others: bool,
}

impl NewRole {
    pub fn new(role_name: impl Into<String>, security_level: i32) -> Self {
        Self {
            role_name: role_name.into(),
            description: None,
            security_level,
            max_attempts: 3,
            can_enroll_others: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub employee_id: i64,
    pub role_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub department: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Employee {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone)]
pub struct NewEmployee {
    pub role_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub department: Option<String>,
}

/// The active enrolled signature of one employee, as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledSignature {
    pub biometric_id: i64,
    pub employee_id: i64,
    /// Fixed-schema JSON; see `facegate_core::Signature::to_json`.
    pub face_encoding: String,
    pub confidence_score: f64,
    pub algorithm_version: String,
    pub created_date: DateTime<Utc>,
    pub is_active: bool,
}

/// An active signature joined to its active owner, for the matching scan.
#[derive(Debug, Clone)]
pub struct SignatureCandidate {
    pub employee_id: i64,
    pub employee_name: String,
    pub role_name: String,
    pub face_encoding: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthOutcome {
    Success,
    Failed,
    Error,
}

impl AuthOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthOutcome::Success => "SUCCESS",
            AuthOutcome::Failed => "FAILED",
            AuthOutcome::Error => "ERROR",
        }
    }
}

impl ToSql for AuthOutcome {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AuthOutcome {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "SUCCESS" => Ok(AuthOutcome::Success),
            "FAILED" => Ok(AuthOutcome::Failed),
            "ERROR" => Ok(AuthOutcome::Error),
            other => Err(FromSqlError::Other(
                format!("unknown authentication outcome '{other}'").into(),
            )),
        }
    }
}

/// One row of the append-only authentication log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthAttempt {
    pub log_id: i64,
    pub employee_id: Option<i64>,
    /// Full name of the referenced employee, joined at read time.
    pub employee_name: Option<String>,
    pub attempt_timestamp: DateTime<Utc>,
    pub result: AuthOutcome,
    pub confidence_score: f64,
    pub failure_reason: Option<String>,
    pub device_location: String,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub employee_id: Option<i64>,
    pub result: AuthOutcome,
    pub confidence_score: f64,
    pub failure_reason: Option<String>,
    pub device_location: String,
    pub processing_time_ms: i64,
    pub attempt_timestamp: DateTime<Utc>,
}

/// Dashboard figures: attempt counts across the whole log, today's
/// attempts, and the size of the directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub error: i64,
    /// Attempts since the start of the current UTC day.
    pub today: i64,
    /// Percentage of SUCCESS attempts, one decimal; 0.0 on an empty log.
    pub success_rate: f64,
    pub total_employees: i64,
    pub active_employees: i64,
}

impl AttemptSummary {
    pub fn rate(success: i64, total: i64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (success as f64 / total as f64 * 1000.0).round() / 10.0
    }
}

/// Result of `authenticate` and `simulate`, serialized as JSON to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthResult {
    pub outcome: AuthOutcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub confidence: f64,
    pub processing_time_ms: i64,
    pub timestamp: DateTime<Utc>,
}

impl AuthResult {
    pub fn failed(message: impl Into<String>, confidence: f64, processing_time_ms: i64) -> Self {
        Self::anonymous(AuthOutcome::Failed, message, confidence, processing_time_ms)
    }

    pub fn error(message: impl Into<String>, processing_time_ms: i64) -> Self {
        Self::anonymous(AuthOutcome::Error, message, 0.0, processing_time_ms)
    }

    fn anonymous(
        outcome: AuthOutcome,
        message: impl Into<String>,
        confidence: f64,
        processing_time_ms: i64,
    ) -> Self {
        Self {
            outcome,
            message: message.into(),
            employee_id: None,
            employee_name: None,
            role: None,
            confidence,
            processing_time_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl EnrollResult {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_wire_format() {
        assert_eq!(serde_json::to_string(&AuthOutcome::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&AuthOutcome::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(serde_json::to_string(&AuthOutcome::Error).unwrap(), "\"ERROR\"");
    }

    #[test]
    fn test_anonymous_result_omits_identity() {
        let json = serde_json::to_value(AuthResult::failed("No face detected", 0.0, 12)).unwrap();
        assert_eq!(json["outcome"], "FAILED");
        assert_eq!(json["message"], "No face detected");
        assert_eq!(json["confidence"], 0.0);
        assert!(json.get("employee_id").is_none());
        assert!(json.get("role").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_full_name() {
        let employee = Employee {
            employee_id: 1,
            role_id: 1,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            department: None,
            last_login: None,
            is_active: true,
        };
        assert_eq!(employee.full_name(), "Ada Lovelace");
    }
}
