//! Routing from `(service, operation)` to concrete endpoints.

use std::collections::HashMap;

use common::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// True when the payload travels in the request body.
    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

/// Method and path template of one operation.
///
/// Path segments of the form `{name}` are filled from the payload. A value
/// is looked up at the top level first, then under `original_request`, so
/// compensations can reuse the forward operation's identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: String,
}

impl Endpoint {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// Renders the path with placeholders substituted from `payload`.
    pub fn render(&self, operation: &str, payload: &Payload) -> Result<String, CallError> {
        let mut rendered = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                rendered.push_str(&rest[open..]);
                return Ok(rendered);
            };
            let name = &after[..close];
            let value = path_value(payload, name).ok_or_else(|| CallError::MissingPathParameter {
                operation: operation.to_string(),
                parameter: name.to_string(),
            })?;
            rendered.push_str(&value);
            rest = &after[close + 1..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

fn path_value(payload: &Payload, name: &str) -> Option<String> {
    let value = payload.get(name).filter(|v| !v.is_null()).or_else(|| {
        payload
            .get("original_request")
            .and_then(Value::as_object)
            .and_then(|original| original.get(name))
            .filter(|v| !v.is_null())
    })?;

    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A fully resolved call destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub service: String,
    pub operation: String,
    pub method: HttpMethod,
    pub url: String,
}

/// Base URLs per service and endpoints per operation.
#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    base_urls: HashMap<String, String>,
    endpoints: HashMap<String, Endpoint>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.set_service(service, base_url);
        self
    }

    pub fn with_endpoint(mut self, operation: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.insert(operation.into(), endpoint);
        self
    }

    /// Registers or replaces the base URL of a service.
    pub fn set_service(&mut self, service: impl Into<String>, base_url: impl Into<String>) {
        let base_url: String = base_url.into();
        self.base_urls
            .insert(service.into(), base_url.trim_end_matches('/').to_string());
    }

    pub fn remove_service(&mut self, service: &str) -> Option<String> {
        self.base_urls.remove(service)
    }

    pub fn base_url(&self, service: &str) -> Option<&str> {
        self.base_urls.get(service).map(String::as_str)
    }

    pub fn contains_service(&self, service: &str) -> bool {
        self.base_urls.contains_key(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.base_urls.keys().map(String::as_str)
    }

    pub fn endpoint(&self, operation: &str) -> Option<&Endpoint> {
        self.endpoints.get(operation)
    }

    /// Resolves the destination of a call.
    pub fn resolve(
        &self,
        service: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<CallTarget, CallError> {
        let base_url = self
            .base_url(service)
            .ok_or_else(|| CallError::ServiceNotFound(service.to_string()))?;
        let endpoint = self
            .endpoint(operation)
            .ok_or_else(|| CallError::OperationNotFound {
                service: service.to_string(),
                operation: operation.to_string(),
            })?;
        let path = endpoint.render(operation, payload)?;

        Ok(CallTarget {
            service: service.to_string(),
            operation: operation.to_string(),
            method: endpoint.method,
            url: format!("{base_url}{path}"),
        })
    }

    /// The parking services and every operation the built-in templates use.
    pub fn parking_defaults() -> Self {
        Self::new()
            .with_service("vehicle_service", "http://localhost:8001")
            .with_service("vehicle_service_backup", "http://localhost:8011")
            .with_service("user_service", "http://localhost:8002")
            .with_service("parking_service", "http://localhost:8003")
            .with_service("parking_record_service", "http://localhost:8004")
            .with_service("notification_service", "http://localhost:8005")
            .with_service("notification_service_backup", "http://localhost:8015")
            .with_service("payment_service", "http://localhost:8006")
            // vehicle entry
            .with_endpoint("verify_license_plate", Endpoint::get("/vehicles/{license_plate}"))
            .with_endpoint("check_user_subscription", Endpoint::get("/users/{user_id}/subscription"))
            .with_endpoint("allocate_parking_space", Endpoint::post("/parking/allocate"))
            .with_endpoint("cancel_allocate_parking_space", Endpoint::post("/parking/release"))
            .with_endpoint("create_entry_record", Endpoint::post("/records/entry"))
            .with_endpoint(
                "cancel_create_entry_record",
                Endpoint::delete("/records/entry/{license_plate}"),
            )
            .with_endpoint("send_entry_notification", Endpoint::post("/notifications/entry"))
            .with_endpoint("update_favorite_parking", Endpoint::post("/users/{user_id}/favorites"))
            .with_endpoint(
                "cancel_update_favorite_parking",
                Endpoint::delete("/users/{user_id}/favorites"),
            )
            // vehicle exit
            .with_endpoint("calculate_parking_fee", Endpoint::post("/fees/calculate"))
            .with_endpoint("update_parking_history", Endpoint::post("/records/history"))
            .with_endpoint("cancel_update_parking_history", Endpoint::post("/records/history/revert"))
            .with_endpoint("update_occupancy_status", Endpoint::post("/parking/occupancy"))
            .with_endpoint(
                "cancel_update_occupancy_status",
                Endpoint::post("/parking/occupancy/revert"),
            )
            .with_endpoint("send_exit_notification", Endpoint::post("/notifications/exit"))
            // payment
            .with_endpoint("process_payment", Endpoint::post("/payments"))
            .with_endpoint("refund_payment", Endpoint::post("/payments/refund"))
            .with_endpoint("send_payment_notification", Endpoint::post("/notifications/payment"))
    }
}
