//! Scriptable in-memory transport for tests and local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Payload;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{CallTarget, ServiceTransport, TransportResponse};
use crate::error::CallError;

/// One queued outcome for an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    /// 200 with the given body.
    Respond(Value),
    /// 500 with `{ "error": message }`.
    Fail(String),
    /// 200 with `{ "error": message }`.
    Reject(String),
    /// The transport cannot reach the service.
    Unreachable(String),
    /// The transport panics with the given message.
    Panic(String),
}

/// A call observed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub operation: String,
    pub payload: Payload,
}

type Key = (String, String);

fn key(service: &str, operation: &str) -> Key {
    (service.to_string(), operation.to_string())
}

#[derive(Debug, Default)]
struct TransportState {
    scripts: HashMap<Key, VecDeque<Scripted>>,
    responses: HashMap<Key, Value>,
    failing: HashSet<Key>,
    delays: HashMap<Key, Duration>,
    calls: Vec<RecordedCall>,
}

/// Answers calls from per-operation scripts.
///
/// For each call the first queued [`Scripted`] outcome is consumed. With an
/// empty queue the operation fails if marked failing, otherwise it answers
/// with its configured response or `{ "ok": true }`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default success body for an operation.
    pub fn respond(&self, service: &str, operation: &str, body: Value) {
        self.state.lock().responses.insert(key(service, operation), body);
    }

    /// Makes an operation fail until [`recover`](Self::recover) is called.
    pub fn fail(&self, service: &str, operation: &str) {
        self.state.lock().failing.insert(key(service, operation));
    }

    pub fn recover(&self, service: &str, operation: &str) {
        self.state.lock().failing.remove(&key(service, operation));
    }

    /// Queues outcomes consumed one per call, ahead of the defaults.
    pub fn script(&self, service: &str, operation: &str, outcomes: impl IntoIterator<Item = Scripted>) {
        self.state
            .lock()
            .scripts
            .entry(key(service, operation))
            .or_default()
            .extend(outcomes);
    }

    /// Delays every answer of an operation.
    pub fn delay(&self, service: &str, operation: &str, delay: Duration) {
        self.state.lock().delays.insert(key(service, operation), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, service: &str, operation: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.service == service && c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, service: &str, operation: &str) -> usize {
        self.calls_to(service, operation).len()
    }

    /// Operations in the order they were called.
    pub fn operations(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn next_outcome(&self, target: &CallTarget, payload: &Payload) -> (Scripted, Option<Duration>) {
        let mut state = self.state.lock();
        let k = key(&target.service, &target.operation);
        state.calls.push(RecordedCall {
            service: target.service.clone(),
            operation: target.operation.clone(),
            payload: payload.clone(),
        });

        let delay = state.delays.get(&k).copied();
        let scripted = state.scripts.get_mut(&k).and_then(VecDeque::pop_front);
        let outcome = match scripted {
            Some(outcome) => outcome,
            None if state.failing.contains(&k) => {
                Scripted::Fail(format!("{} unavailable", target.service))
            }
            None => Scripted::Respond(
                state
                    .responses
                    .get(&k)
                    .cloned()
                    .unwrap_or_else(|| json!({ "ok": true })),
            ),
        };
        (outcome, delay)
    }
}

#[async_trait]
impl ServiceTransport for InMemoryTransport {
    async fn send(
        &self,
        target: &CallTarget,
        payload: &Payload,
    ) -> Result<TransportResponse, CallError> {
        let (outcome, delay) = self.next_outcome(target, payload);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Scripted::Respond(body) => Ok(TransportResponse::ok(body)),
            Scripted::Fail(message) => Ok(TransportResponse {
                status: 500,
                body: json!({ "error": message }),
            }),
            Scripted::Reject(message) => Ok(TransportResponse::ok(json!({ "error": message }))),
            Scripted::Unreachable(message) => Err(CallError::Transport {
                service: target.service.clone(),
                message,
            }),
            Scripted::Panic(message) => panic!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::HttpMethod;

    fn target(service: &str, operation: &str) -> CallTarget {
        CallTarget {
            service: service.into(),
            operation: operation.into(),
            method: HttpMethod::Post,
            url: format!("memory://{service}/{operation}"),
        }
    }

    #[tokio::test]
    async fn test_default_response() {
        let transport = InMemoryTransport::new();
        let response = transport
            .send(&target("parking_service", "allocate_parking_space"), &Payload::new())
            .await
            .unwrap();
        assert_eq!(response, TransportResponse::ok(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_script_is_consumed_before_defaults() {
        let transport = InMemoryTransport::new();
        let t = target("parking_service", "allocate_parking_space");
        transport.respond("parking_service", "allocate_parking_space", json!({ "space_id": "A-1" }));
        transport.script(
            "parking_service",
            "allocate_parking_space",
            [Scripted::Fail("full".into())],
        );

        let first = transport.send(&t, &Payload::new()).await.unwrap();
        assert_eq!(first.status, 500);
        let second = transport.send(&t, &Payload::new()).await.unwrap();
        assert_eq!(second.body["space_id"], "A-1");
        assert_eq!(transport.call_count("parking_service", "allocate_parking_space"), 2);
    }

    #[tokio::test]
    async fn test_fail_and_recover() {
        let transport = InMemoryTransport::new();
        let t = target("user_service", "check_user_subscription");

        transport.fail("user_service", "check_user_subscription");
        assert_eq!(transport.send(&t, &Payload::new()).await.unwrap().status, 500);

        transport.recover("user_service", "check_user_subscription");
        assert_eq!(transport.send(&t, &Payload::new()).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_unreachable_is_transport_error() {
        let transport = InMemoryTransport::new();
        transport.script(
            "vehicle_service",
            "verify_license_plate",
            [Scripted::Unreachable("connection refused".into())],
        );
        let err = transport
            .send(&target("vehicle_service", "verify_license_plate"), &Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transport { .. }));
    }
}
