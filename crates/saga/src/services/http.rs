//! HTTP transport backed by `reqwest`.

use async_trait::async_trait;
use common::Payload;
use serde_json::Value;

use super::{CallTarget, HttpMethod, ServiceTransport, TransportResponse};
use crate::error::CallError;

/// Sends calls as JSON over HTTP.
///
/// `GET` requests carry scalar payload fields as query parameters; every
/// other method sends the payload as the JSON body.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn send(
        &self,
        target: &CallTarget,
        payload: &Payload,
    ) -> Result<TransportResponse, CallError> {
        let request = match target.method {
            HttpMethod::Get => self.client.get(&target.url).query(&query_pairs(payload)),
            HttpMethod::Post => self.client.post(&target.url).json(payload),
            HttpMethod::Put => self.client.put(&target.url).json(payload),
            HttpMethod::Delete => self.client.delete(&target.url).json(payload),
        };

        let response = request.send().await.map_err(|e| CallError::Transport {
            service: target.service.clone(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| CallError::Transport {
            service: target.service.clone(),
            message: e.to_string(),
        })?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => value,
                // Non-2xx bodies are reported verbatim.
                Err(_) if !(200..300).contains(&status) => Value::String(text),
                Err(e) => {
                    return Err(CallError::InvalidResponse {
                        service: target.service.clone(),
                        message: e.to_string(),
                    });
                }
            }
        };

        Ok(TransportResponse { status, body })
    }
}

fn query_pairs(payload: &Payload) -> Vec<(String, String)> {
    payload
        .iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key.clone(), s.clone())),
            Value::Number(n) => Some((key.clone(), n.to_string())),
            Value::Bool(b) => Some((key.clone(), b.to_string())),
            _ => None,
        })
        .collect()
}
