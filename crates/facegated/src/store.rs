//! SQLite-backed directory, signature store and authentication log.
//!
//! One connection, driven on its own thread by `tokio-rusqlite`. Every
//! public operation is a single serialized unit of work, so per-employee
//! upserts cannot interleave and log rows are ordered by commit.

use crate::models::{
    AttemptSummary, AuthAttempt, AuthOutcome, EnrolledSignature, Employee, NewAttempt,
    NewEmployee, NewRole, Role, SignatureCandidate,
};
use chrono::{DateTime, NaiveTime, Utc};
use facegate_core::Signature;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS roles (
    role_id           INTEGER PRIMARY KEY AUTOINCREMENT,
    role_name         TEXT    NOT NULL,
    description       TEXT,
    security_level    INTEGER NOT NULL,
    max_attempts      INTEGER NOT NULL DEFAULT 3,
    can_enroll_others INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS employees (
    employee_id INTEGER PRIMARY KEY AUTOINCREMENT,
    role_id     INTEGER NOT NULL REFERENCES roles(role_id),
    first_name  TEXT    NOT NULL,
    last_name   TEXT    NOT NULL,
    email       TEXT    NOT NULL UNIQUE COLLATE NOCASE,
    department  TEXT,
    last_login  TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS biometric_data (
    biometric_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id       INTEGER NOT NULL REFERENCES employees(employee_id),
    face_encoding     TEXT    NOT NULL,
    confidence_score  REAL    NOT NULL,
    algorithm_version TEXT    NOT NULL,
    created_date      TEXT    NOT NULL,
    is_active         INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS biometric_data_one_active
    ON biometric_data(employee_id) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS authentication_log (
    log_id             INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id        INTEGER REFERENCES employees(employee_id),
    attempt_timestamp  TEXT    NOT NULL,
    result             TEXT    NOT NULL CHECK (result IN ('SUCCESS', 'FAILED', 'ERROR')),
    confidence_score   REAL    NOT NULL,
    failure_reason     TEXT,
    device_location    TEXT    NOT NULL,
    processing_time_ms INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS authentication_log_no_update
    BEFORE UPDATE ON authentication_log
BEGIN
    SELECT RAISE(ABORT, 'authentication_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS authentication_log_no_delete
    BEFORE DELETE ON authentication_log
BEGIN
    SELECT RAISE(ABORT, 'authentication_log is append-only');
END;
";

const EMPLOYEE_COLUMNS: &str =
    "employee_id, role_id, first_name, last_name, email, department, last_login, is_active";

const SIGNATURE_COLUMNS: &str = "biometric_id, employee_id, face_encoding, confidence_score, \
     algorithm_version, created_date, is_active";

const ATTEMPT_SELECT: &str = "SELECT l.log_id, l.employee_id, e.first_name || ' ' || e.last_name, \
     l.attempt_timestamp, l.result, l.confidence_score, l.failure_reason, l.device_location, \
     l.processing_time_ms
     FROM authentication_log l
     LEFT JOIN employees e ON e.employee_id = l.employee_id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("invalid attempt: {0}")]
    InvalidAttempt(&'static str),
    #[error("database error: {0}")]
    Database(tokio_rusqlite::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, msg)) = &err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(msg.clone().unwrap_or_else(|| code.to_string()));
            }
        }
        StoreError::Database(err)
    }
}

/// Handle to the facegate database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------------

    pub async fn create_role(&self, input: NewRole) -> Result<Role, StoreError> {
        let role = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO roles (role_name, description, security_level, max_attempts, can_enroll_others)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        input.role_name,
                        input.description,
                        input.security_level,
                        input.max_attempts,
                        input.can_enroll_others
                    ],
                )?;
                Ok(Role {
                    role_id: conn.last_insert_rowid(),
                    role_name: input.role_name,
                    description: input.description,
                    security_level: input.security_level,
                    max_attempts: input.max_attempts,
                    can_enroll_others: input.can_enroll_others,
                })
            })
            .await?;
        tracing::info!(role_id = role.role_id, role_name = %role.role_name, "role created");
        Ok(role)
    }

    /// Insert a new active employee. A duplicate email is a [`StoreError::Conflict`].
    pub async fn create_employee(&self, input: NewEmployee) -> Result<Employee, StoreError> {
        let role_id = input.role_id;
        let employee = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let role_exists = tx
                    .query_row("SELECT 1 FROM roles WHERE role_id = ?1", [input.role_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !role_exists {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO employees (role_id, first_name, last_name, email, department)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        input.role_id,
                        input.first_name,
                        input.last_name,
                        input.email,
                        input.department
                    ],
                )?;
                let employee_id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Some(Employee {
                    employee_id,
                    role_id: input.role_id,
                    first_name: input.first_name,
                    last_name: input.last_name,
                    email: input.email,
                    department: input.department,
                    last_login: None,
                    is_active: true,
                }))
            })
            .await?
            .ok_or(StoreError::NotFound { entity: "role", id: role_id })?;
        tracing::info!(employee_id = employee.employee_id, "employee created");
        Ok(employee)
    }

    pub async fn set_employee_active(&self, employee_id: i64, active: bool) -> Result<(), StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE employees SET is_active = ?1 WHERE employee_id = ?2",
                    params![active, employee_id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "employee", id: employee_id });
        }
        tracing::info!(employee_id, active, "employee active flag updated");
        Ok(())
    }

    pub async fn get_active_employee(&self, employee_id: i64) -> Result<Option<Employee>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {EMPLOYEE_COLUMNS} FROM employees
                             WHERE employee_id = ?1 AND is_active = 1"
                        ),
                        [employee_id],
                        employee_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }

    pub async fn list_active_employees(&self) -> Result<Vec<Employee>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE is_active = 1 ORDER BY employee_id"
                ))?;
                let rows = stmt.query_map([], employee_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    pub async fn get_role(&self, employee: &Employee) -> Result<Role, StoreError> {
        let role_id = employee.role_id;
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT role_id, role_name, description, security_level, max_attempts, can_enroll_others
                         FROM roles WHERE role_id = ?1",
                        [role_id],
                        |row| {
                            Ok(Role {
                                role_id: row.get(0)?,
                                role_name: row.get(1)?,
                                description: row.get(2)?,
                                security_level: row.get(3)?,
                                max_attempts: row.get(4)?,
                                can_enroll_others: row.get(5)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?
            .ok_or(StoreError::NotFound { entity: "role", id: role_id })
    }

    // -----------------------------------------------------------------------
    // Signatures
    // -----------------------------------------------------------------------

    /// Snapshot of every active signature owned by an active employee.
    pub async fn active_signatures(&self) -> Result<Vec<SignatureCandidate>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.employee_id, e.first_name || ' ' || e.last_name, r.role_name, b.face_encoding
                     FROM biometric_data b
                     JOIN employees e ON e.employee_id = b.employee_id
                     JOIN roles r ON r.role_id = e.role_id
                     WHERE b.is_active = 1 AND e.is_active = 1
                     ORDER BY b.biometric_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(SignatureCandidate {
                        employee_id: row.get(0)?,
                        employee_name: row.get(1)?,
                        role_name: row.get(2)?,
                        face_encoding: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    pub async fn active_signature(
        &self,
        employee_id: i64,
    ) -> Result<Option<EnrolledSignature>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {SIGNATURE_COLUMNS} FROM biometric_data
                             WHERE employee_id = ?1 AND is_active = 1"
                        ),
                        [employee_id],
                        signature_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }

    /// Replace the employee's active signature in place, or create it.
    pub async fn upsert_signature(
        &self,
        employee_id: i64,
        signature: Signature,
        algorithm: String,
    ) -> Result<EnrolledSignature, StoreError> {
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let active = tx
                    .query_row(
                        "SELECT is_active FROM employees WHERE employee_id = ?1",
                        [employee_id],
                        |row| row.get::<_, bool>(0),
                    )
                    .optional()?
                    .unwrap_or(false);
                if !active {
                    return Ok(None);
                }

                let encoded = signature.to_json();
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT biometric_id FROM biometric_data
                         WHERE employee_id = ?1 AND is_active = 1",
                        [employee_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                let biometric_id = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE biometric_data
                             SET face_encoding = ?1, confidence_score = ?2, algorithm_version = ?3
                             WHERE biometric_id = ?4",
                            params![encoded, signature.confidence, algorithm, id],
                        )?;
                        id
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO biometric_data
                                (employee_id, face_encoding, confidence_score, algorithm_version, created_date, is_active)
                             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                            params![employee_id, encoded, signature.confidence, algorithm, Utc::now()],
                        )?;
                        tx.last_insert_rowid()
                    }
                };

                let record = tx.query_row(
                    &format!("SELECT {SIGNATURE_COLUMNS} FROM biometric_data WHERE biometric_id = ?1"),
                    [biometric_id],
                    signature_from_row,
                )?;
                tx.commit()?;
                Ok(Some(record))
            })
            .await?
            .ok_or(StoreError::NotFound { entity: "employee", id: employee_id })?;

        tracing::info!(
            employee_id,
            biometric_id = record.biometric_id,
            algorithm = %record.algorithm_version,
            "signature enrolled"
        );
        Ok(record)
    }

    /// Write an active signature row verbatim, bypassing encoding.
    #[cfg(test)]
    pub(crate) async fn insert_raw_signature(
        &self,
        employee_id: i64,
        face_encoding: &str,
    ) -> Result<(), StoreError> {
        let face_encoding = face_encoding.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO biometric_data
                        (employee_id, face_encoding, confidence_score, algorithm_version, created_date, is_active)
                     VALUES (?1, ?2, 0.9, 'raw', ?3, 1)",
                    params![employee_id, face_encoding, Utc::now()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Authentication log
    // -----------------------------------------------------------------------

    /// Append an attempt. A SUCCESS also stamps the employee's `last_login`
    /// in the same transaction; if the employee is no longer active, neither
    /// write happens and [`StoreError::NotFound`] is returned.
    pub async fn record_attempt(&self, attempt: NewAttempt) -> Result<AuthAttempt, StoreError> {
        let success_employee = match (attempt.result, attempt.employee_id) {
            (AuthOutcome::Success, None) => {
                return Err(StoreError::InvalidAttempt("successful attempt without an employee"))
            }
            (AuthOutcome::Success, Some(id)) => Some(id),
            _ => None,
        };
        if attempt.result != AuthOutcome::Failed && attempt.failure_reason.is_some() {
            return Err(StoreError::InvalidAttempt("failure reason on a non-failed attempt"));
        }

        let recorded = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO authentication_log
                        (employee_id, attempt_timestamp, result, confidence_score, failure_reason,
                         device_location, processing_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        attempt.employee_id,
                        attempt.attempt_timestamp,
                        attempt.result,
                        attempt.confidence_score,
                        attempt.failure_reason,
                        attempt.device_location,
                        attempt.processing_time_ms
                    ],
                )?;
                let log_id = tx.last_insert_rowid();

                if let Some(employee_id) = success_employee {
                    let updated = tx.execute(
                        "UPDATE employees SET last_login = ?1 WHERE employee_id = ?2 AND is_active = 1",
                        params![attempt.attempt_timestamp, employee_id],
                    )?;
                    if updated == 0 {
                        // Dropping the transaction rolls back the log insert.
                        return Ok(None);
                    }
                }

                let recorded = tx.query_row(
                    &format!("{ATTEMPT_SELECT} WHERE l.log_id = ?1"),
                    [log_id],
                    attempt_from_row,
                )?;
                tx.commit()?;
                Ok(Some(recorded))
            })
            .await?;

        let recorded = recorded.ok_or(StoreError::NotFound {
            entity: "employee",
            id: success_employee.unwrap_or_default(),
        })?;
        tracing::debug!(
            log_id = recorded.log_id,
            employee_id = ?recorded.employee_id,
            result = recorded.result.as_str(),
            "authentication attempt recorded"
        );
        Ok(recorded)
    }

    /// Most recent attempts first, with the employee's name where known.
    pub async fn recent_attempts(&self, limit: u32) -> Result<Vec<AuthAttempt>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{ATTEMPT_SELECT} ORDER BY l.log_id DESC LIMIT ?1"))?;
                let rows = stmt.query_map([limit], attempt_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    pub async fn attempt_summary(&self) -> Result<AttemptSummary, StoreError> {
        self.attempt_summary_at(Utc::now()).await
    }

    /// Dashboard figures as of `now`; "today" starts at UTC midnight.
    pub async fn attempt_summary_at(&self, now: DateTime<Utc>) -> Result<AttemptSummary, StoreError> {
        let today_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        Ok(self
            .conn
            .call(move |conn| {
                let mut summary = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(result = 'SUCCESS'), 0),
                            COALESCE(SUM(result = 'FAILED'), 0),
                            COALESCE(SUM(result = 'ERROR'), 0),
                            COALESCE(SUM(attempt_timestamp >= ?1), 0)
                     FROM authentication_log",
                    [today_start],
                    |row| {
                        Ok(AttemptSummary {
                            total: row.get(0)?,
                            success: row.get(1)?,
                            failed: row.get(2)?,
                            error: row.get(3)?,
                            today: row.get(4)?,
                            ..AttemptSummary::default()
                        })
                    },
                )?;
                let (total_employees, active_employees): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM employees",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                summary.total_employees = total_employees;
                summary.active_employees = active_employees;
                summary.success_rate = AttemptSummary::rate(summary.success, summary.total);
                Ok(summary)
            })
            .await?)
    }
}

fn employee_from_row(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        employee_id: row.get(0)?,
        role_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        email: row.get(4)?,
        department: row.get(5)?,
        last_login: row.get(6)?,
        is_active: row.get(7)?,
    })
}

fn signature_from_row(row: &Row<'_>) -> rusqlite::Result<EnrolledSignature> {
    Ok(EnrolledSignature {
        biometric_id: row.get(0)?,
        employee_id: row.get(1)?,
        face_encoding: row.get(2)?,
        confidence_score: row.get(3)?,
        algorithm_version: row.get(4)?,
        created_date: row.get(5)?,
        is_active: row.get(6)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<AuthAttempt> {
    Ok(AuthAttempt {
        log_id: row.get(0)?,
        employee_id: row.get(1)?,
        employee_name: row.get(2)?,
        attempt_timestamp: row.get(3)?,
        result: row.get(4)?,
        confidence_score: row.get(5)?,
        failure_reason: row.get(6)?,
        device_location: row.get(7)?,
        processing_time_ms: row.get(8)?,
    })
}
