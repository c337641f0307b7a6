//! Uniform `(service, operation, payload)` calls over a pluggable transport.

pub mod directory;
pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Payload;
use serde_json::Value;

use crate::error::CallError;

pub use directory::{CallTarget, Endpoint, HttpMethod, ServiceDirectory};
pub use http::HttpTransport;
pub use memory::{InMemoryTransport, RecordedCall, Scripted};

/// The raw answer of a downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves a request to a resolved target and returns the raw response.
///
/// Implementations report only failures to reach the service; status codes
/// and error bodies are interpreted by [`ServiceClient`].
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn send(&self, target: &CallTarget, payload: &Payload)
    -> Result<TransportResponse, CallError>;
}

/// Resolves, sends and interprets one downstream call.
#[derive(Clone)]
pub struct ServiceClient {
    directory: Arc<ServiceDirectory>,
    transport: Arc<dyn ServiceTransport>,
    deadline: Duration,
}

impl ServiceClient {
    pub fn new(
        directory: ServiceDirectory,
        transport: Arc<dyn ServiceTransport>,
        deadline: Duration,
    ) -> Self {
        Self {
            directory: Arc::new(directory),
            transport,
            deadline,
        }
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Checks that a call can be routed without issuing it.
    pub fn resolve(
        &self,
        service: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<CallTarget, CallError> {
        self.directory.resolve(service, operation, payload)
    }

    /// Issues a call and returns the parsed response body.
    ///
    /// Fails on unroutable calls, transport failures, non-2xx statuses,
    /// `{ "error": ... }` bodies and calls that outlive the deadline.
    pub async fn call(
        &self,
        service: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<Payload, CallError> {
        let target = self.resolve(service, operation, payload)?;
        tracing::debug!(
            service,
            operation,
            method = target.method.as_str(),
            url = %target.url,
            "calling service"
        );

        let response = tokio::time::timeout(self.deadline, self.transport.send(&target, payload))
            .await
            .map_err(|_| CallError::DeadlineExceeded {
                service: service.to_string(),
                deadline: self.deadline,
            })??;

        interpret(service, response)
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("directory", &self.directory)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

fn interpret(service: &str, response: TransportResponse) -> Result<Payload, CallError> {
    if !response.is_success() {
        return Err(CallError::Status {
            service: service.to_string(),
            status: response.status,
            body: response.body.to_string(),
        });
    }

    match response.body {
        Value::Object(map) => match map.get("error") {
            Some(error) if !error.is_null() => Err(CallError::Rejected {
                service: service.to_string(),
                message: error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            }),
            _ => Ok(map),
        },
        Value::Null => Ok(Payload::new()),
        other => {
            let mut wrapped = Payload::new();
            wrapped.insert("result".to_string(), other);
            Ok(wrapped)
        }
    }
}
