//! Transport abstraction for the JSON:API source.
//!
//! `HttpTransport` wraps reqwest with a per-request timeout; `FakeTransport`
//! plays scripted responses and records every request, which is how the
//! source is tested (and how offline mode is simulated).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use orbit_api::{OrbitError, Result};

use crate::documents::JSONAPI_CONTENT_TYPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl JsonApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

/// Sends one request and returns the raw status + parsed body. Transport
/// failures (unreachable, timeout) surface as `NetworkError`; status-code
/// interpretation is the caller's concern.
#[async_trait]
pub trait JsonApiTransport: Send + Sync {
    async fn send(&self, request: JsonApiRequest) -> Result<JsonApiResponse>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JsonApiTransport for HttpTransport {
    async fn send(&self, request: JsonApiRequest) -> Result<JsonApiResponse> {
        debug!(method = request.method.as_str(), url = %request.url, "sending request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Patch => self.client.patch(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
        };
        builder = builder
            .header("Content-Type", JSONAPI_CONTENT_TYPE)
            .header("Accept", JSONAPI_CONTENT_TYPE)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let timeout_ms = request.timeout.as_millis();
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                OrbitError::Network(format!("No fetch response within {timeout_ms}ms."))
            } else {
                OrbitError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| OrbitError::Network(err.to_string()))?;
        let body = if text.is_empty() {
            None
        } else {
            serde_json::from_str(&text).ok()
        };
        Ok(JsonApiResponse { status, body })
    }
}

/// Scripted transport for tests and offline simulation: responses are played
/// in order, requests recorded.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<JsonApiResponse>>>,
    requests: Mutex<Vec<JsonApiRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: JsonApiResponse) {
        self.responses
            .lock()
            .expect("fake transport lock poisoned")
            .push_back(Ok(response));
    }

    pub fn enqueue_error(&self, error: OrbitError) {
        self.responses
            .lock()
            .expect("fake transport lock poisoned")
            .push_back(Err(error));
    }

    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<JsonApiRequest> {
        self.requests
            .lock()
            .expect("fake transport lock poisoned")
            .clone()
    }
}

#[async_trait]
impl JsonApiTransport for FakeTransport {
    async fn send(&self, request: JsonApiRequest) -> Result<JsonApiResponse> {
        self.requests
            .lock()
            .expect("fake transport lock poisoned")
            .push(request);
        self.responses
            .lock()
            .expect("fake transport lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(JsonApiResponse::no_content()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fake_transport_plays_responses_in_order() {
        let transport = FakeTransport::new();
        transport.enqueue_response(JsonApiResponse::ok(json!({"data": []})));
        transport.enqueue_error(OrbitError::Network("down".to_string()));

        let request = JsonApiRequest {
            method: HttpMethod::Get,
            url: "http://example.com/planets".to_string(),
            body: None,
            timeout: Duration::from_secs(5),
        };

        let first = transport.send(request.clone()).await.unwrap();
        assert_eq!(first.status, 200);
        assert!(transport.send(request.clone()).await.is_err());
        // Exhausted scripts default to 204.
        let third = transport.send(request).await.unwrap();
        assert_eq!(third.status, 204);
        assert_eq!(transport.sent().len(), 3);
    }
}
