use crate::authenticator::{AuthError, Authenticator};
use crate::models::{NewEmployee, NewRole};
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Gate1";
pub const OBJECT_PATH: &str = "/org/facegate/Gate1";

/// D-Bus interface for the Facegate daemon.
///
/// Bus name: org.facegate.Gate1
/// Object path: /org/facegate/Gate1
///
/// Every method returns a JSON document.
pub struct GateService {
    auth: Arc<Authenticator>,
    store: Store,
    model_variant: String,
}

impl GateService {
    pub fn new(auth: Arc<Authenticator>, store: Store, model_variant: String) -> Self {
        Self {
            auth,
            store,
            model_variant,
        }
    }
}

#[interface(name = "org.facegate.Gate1")]
impl GateService {
    /// Authenticate the face in a base64 (optionally data-URL) image.
    async fn authenticate(&self, image: &str) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "authenticate requested");
        to_json(&self.auth.authenticate(image.to_owned()).await)
    }

    /// Simulated authentication for an employee, without imagery.
    async fn simulate(&self, employee_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, "simulate requested");
        let result = self.auth.simulate(employee_id).await.map_err(auth_error)?;
        to_json(&result)
    }

    /// Enroll or replace an employee's face signature.
    async fn enroll(&self, employee_id: i64, image: &str) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, bytes = image.len(), "enroll requested");
        let result = self
            .auth
            .enroll(employee_id, image.to_owned())
            .await
            .map_err(auth_error)?;
        to_json(&result)
    }

    async fn create_role(
        &self,
        role_name: &str,
        description: &str,
        security_level: i32,
        max_attempts: i32,
        can_enroll_others: bool,
    ) -> zbus::fdo::Result<String> {
        let role = self
            .store
            .create_role(NewRole {
                description: non_empty(description),
                max_attempts,
                can_enroll_others,
                ..NewRole::new(role_name, security_level)
            })
            .await
            .map_err(store_error)?;
        to_json(&role)
    }

    async fn create_employee(
        &self,
        role_id: i64,
        first_name: &str,
        last_name: &str,
        email: &str,
        department: &str,
    ) -> zbus::fdo::Result<String> {
        let employee = self
            .store
            .create_employee(NewEmployee {
                role_id,
                first_name: first_name.to_owned(),
                last_name: last_name.to_owned(),
                email: email.to_owned(),
                department: non_empty(department),
            })
            .await
            .map_err(store_error)?;
        to_json(&employee)
    }

    async fn set_employee_active(&self, employee_id: i64, active: bool) -> zbus::fdo::Result<bool> {
        self.store
            .set_employee_active(employee_id, active)
            .await
            .map_err(store_error)?;
        Ok(active)
    }

    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.list_active_employees().await.map_err(store_error)?)
    }

    /// The employee's active enrolled signature.
    async fn get_signature(&self, employee_id: i64) -> zbus::fdo::Result<String> {
        let record = self
            .store
            .active_signature(employee_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                zbus::fdo::Error::UnknownObject(format!("no active signature for employee {employee_id}"))
            })?;
        to_json(&record)
    }

    async fn recent_attempts(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(&self.store.recent_attempts(limit).await.map_err(store_error)?)
    }

    async fn attempt_summary(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.attempt_summary().await.map_err(store_error)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let employees = self.store.list_active_employees().await.map_err(store_error)?;
        let enrolled = self.store.active_signatures().await.map_err(store_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_variant": self.model_variant,
            "algorithm": self.auth.algorithm(),
            "active_employees": employees.len(),
            "enrolled_signatures": enrolled.len(),
        })
        .to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn auth_error(err: AuthError) -> zbus::fdo::Error {
    match err {
        AuthError::EmployeeNotFound(_) => zbus::fdo::Error::UnknownObject(err.to_string()),
        AuthError::Store(inner) => store_error(inner),
        AuthError::Engine(_) => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn store_error(err: StoreError) -> zbus::fdo::Error {
    match err {
        StoreError::NotFound { .. } => zbus::fdo::Error::UnknownObject(err.to_string()),
        StoreError::Conflict(_) => zbus::fdo::Error::FileExists(err.to_string()),
        _ => {
            tracing::error!(error = %err, "store operation failed");
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}
