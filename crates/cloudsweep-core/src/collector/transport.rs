use crate::schema::{EndpointId, HttpMethod};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use super::result::CallError;

/// One concrete request derived from an endpoint description.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub endpoint: EndpointId,
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode response body: {0}")]
    Decode(String),
}

impl From<TransportError> for CallError {
    fn from(error: TransportError) -> Self {
        let status = match &error {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        };
        CallError {
            message: error.to_string(),
            status,
        }
    }
}

/// The collector's only way of talking to a provider.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError>;
}

/// Provider REST client over HTTPS.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(access_token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("cloudsweep/", env!("CARGO_PKG_VERSION"))),
        );

        if let Some(token) = access_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("Invalid access token")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self
                .client
                .post(&request.url)
                .json(&Value::Object(Default::default())),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: truncate(&body, 300),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

fn truncate(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

type FixtureKey = (String, Vec<(String, String)>);

#[derive(Debug, Deserialize)]
struct FixtureFile {
    responses: Vec<FixtureEntry>,
}

#[derive(Debug, Deserialize)]
struct FixtureEntry {
    url: String,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    body: Value,
}

/// Replays canned provider responses keyed by URL and query string, and
/// records every request it receives.
#[derive(Default)]
pub struct FixtureTransport {
    responses: HashMap<FixtureKey, Result<Value, TransportError>>,
    latency: Option<Duration>,
    log: Mutex<Vec<ApiRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load recorded responses from a JSON file of the form
    /// `{"responses": [{"url": ..., "query": {...}, "body": ...}, {"url": ..., "status": 403}]}`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture file '{}'", path.display()))?;
        let file: FixtureFile = serde_json::from_str(&content)
            .with_context(|| format!("Invalid fixture file '{}'", path.display()))?;

        let mut transport = Self::new();
        for entry in file.responses {
            let query: Vec<(&str, &str)> = entry
                .query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let key = fixture_key(entry.url, &query);
            let response = match entry.status {
                Some(status) if !(200..300).contains(&status) => Err(TransportError::Status {
                    status,
                    message: "recorded failure".to_string(),
                }),
                _ => Ok(entry.body),
            };
            transport.responses.insert(key, response);
        }
        Ok(transport)
    }

    pub fn respond(self, url: impl Into<String>, body: Value) -> Self {
        self.respond_with_query(url, &[], body)
    }

    pub fn respond_with_query(
        mut self,
        url: impl Into<String>,
        query: &[(&str, &str)],
        body: Value,
    ) -> Self {
        self.responses.insert(fixture_key(url.into(), query), Ok(body));
        self
    }

    pub fn fail(mut self, url: impl Into<String>, status: u16) -> Self {
        self.responses.insert(
            fixture_key(url.into(), &[]),
            Err(TransportError::Status {
                status,
                message: "fixture failure".to_string(),
            }),
        );
        self
    }

    /// Delay every response, so concurrent requests overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or_default()
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.requests().iter().filter(|r| r.url == url).count()
    }

    /// Highest number of requests observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

fn fixture_key(url: String, query: &[(&str, &str)]) -> FixtureKey {
    let mut query: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    query.sort();
    (url, query)
}

#[async_trait]
impl ApiTransport for FixtureTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, TransportError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut query = request.query.clone();
        query.sort();
        self.responses
            .get(&(request.url.clone(), query))
            .cloned()
            .unwrap_or_else(|| {
                Err(TransportError::Status {
                    status: 404,
                    message: format!("no fixture for {}", request.url),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(url: &str, query: Vec<(String, String)>) -> ApiRequest {
        ApiRequest {
            endpoint: EndpointId::new("svc", "list"),
            method: HttpMethod::Get,
            url: url.to_string(),
            query,
        }
    }

    #[tokio::test]
    async fn test_fixture_matches_url_and_query() {
        let transport = FixtureTransport::new()
            .respond("https://api/x", json!({"page": 1}))
            .respond_with_query("https://api/x", &[("pageToken", "t1")], json!({"page": 2}));

        let first = transport.send(&get("https://api/x", vec![])).await.unwrap();
        let second = transport
            .send(&get("https://api/x", vec![("pageToken".into(), "t1".into())]))
            .await
            .unwrap();

        assert_eq!(first["page"], 1);
        assert_eq!(second["page"], 2);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_fixture_failures_map_to_call_errors() {
        let transport = FixtureTransport::new().fail("https://api/denied", 403);

        let err = transport.send(&get("https://api/denied", vec![])).await.unwrap_err();
        let call_error = CallError::from(err);
        assert_eq!(call_error.status, Some(403));

        let missing = transport.send(&get("https://api/other", vec![])).await.unwrap_err();
        assert!(matches!(missing, TransportError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_load_fixture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(
            &path,
            r#"{"responses": [
                {"url": "https://api/a", "body": {"items": [1]}},
                {"url": "https://api/a", "query": {"pageToken": "t"}, "body": {"items": [2]}},
                {"url": "https://api/denied", "status": 403}
            ]}"#,
        )
        .unwrap();

        let transport = FixtureTransport::load(&path).unwrap();
        let paged = transport
            .send(&get("https://api/a", vec![("pageToken".into(), "t".into())]))
            .await
            .unwrap();
        assert_eq!(paged["items"][0], 2);
        let denied = transport.send(&get("https://api/denied", vec![])).await.unwrap_err();
        assert!(matches!(denied, TransportError::Status { status: 403, .. }));
    }

    #[test]
    fn test_truncate_long_bodies() {
        assert_eq!(truncate("  short ", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
