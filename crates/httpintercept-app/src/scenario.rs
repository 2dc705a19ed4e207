//! Canned responses loaded from a JSON file.
//!
//! ```json
//! {
//!   "responses": [
//!     { "path": "/health", "method": "GET", "status": 200,
//!       "headers": { "Content-Type": "application/json" },
//!       "body": "{\"ok\":true}" }
//!   ],
//!   "fallback": { "status": 404, "body": "not intercepted\n" }
//! }
//! ```
//!
//! The file is re-read whenever the server asks for the active scenario, so a
//! `SIGHUP` picks up edits. A file that fails to load keeps the last good set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;
use httpintercept_proxy::{
    DefaultHandler, HookError, InterceptHandler, InterceptRequest, ResponseBody, ScenarioSource,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One canned response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CannedResponse {
    /// Request path to match exactly.
    pub path: String,
    /// Request method to match; any method if absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Host header to match (port ignored); any host if absent.
    #[serde(default)]
    pub host: Option<String>,
    /// Response status.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body.
    #[serde(default)]
    pub body: String,
}

/// Response for requests no entry matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_status() -> u16 {
    200
}

/// Contents of a response file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSet {
    #[serde(default)]
    pub responses: Vec<CannedResponse>,
    /// Unmatched requests get the built-in description page when absent.
    #[serde(default)]
    pub fallback: Option<Fallback>,
}

impl ResponseSet {
    /// Reads and parses a response file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid response file {}", path.display()))
    }

    fn find(&self, method: &str, host: Option<&str>, path: &str) -> Option<&CannedResponse> {
        self.responses.iter().find(|entry| {
            entry.path == path
                && entry
                    .method
                    .as_deref()
                    .map_or(true, |m| m.eq_ignore_ascii_case(method))
                && entry
                    .host
                    .as_deref()
                    .map_or(true, |h| host.is_some_and(|actual| h.eq_ignore_ascii_case(actual)))
        })
    }
}

/// Handler answering from a [`ResponseSet`].
#[derive(Debug, Clone)]
pub struct CannedHandler {
    set: Arc<ResponseSet>,
}

impl CannedHandler {
    pub fn new(set: ResponseSet) -> Self {
        Self { set: Arc::new(set) }
    }
}

fn build_response(
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
) -> Result<Response<ResponseBody>, HookError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    Ok(builder.body(Full::new(Bytes::from(body.to_owned())))?)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[async_trait]
impl InterceptHandler for CannedHandler {
    async fn handle(&self, request: InterceptRequest) -> Result<Response<ResponseBody>, HookError> {
        let req = &request.request;
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(strip_port);

        if let Some(entry) = self.set.find(req.method().as_str(), host, req.uri().path()) {
            tracing::debug!("{} {} matched canned response", req.method(), req.uri().path());
            return build_response(entry.status, &entry.headers, &entry.body);
        }
        match &self.set.fallback {
            Some(fallback) => build_response(fallback.status, &fallback.headers, &fallback.body),
            None => DefaultHandler.handle(request).await,
        }
    }
}

/// Scenario source backed by a response file.
pub struct ResponseFileScenario {
    path: PathBuf,
    current: RwLock<Arc<CannedHandler>>,
}

impl std::fmt::Debug for ResponseFileScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFileScenario")
            .field("path", &self.path)
            .field("responses", &self.current.read().set.responses.len())
            .finish()
    }
}

impl ResponseFileScenario {
    /// Loads `path`; fails if the initial load fails.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let set = ResponseSet::load(&path)?;
        tracing::info!("Loaded {} canned response(s) from {:?}", set.responses.len(), path);
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(CannedHandler::new(set))),
        })
    }

    /// Returns the response file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScenarioSource for ResponseFileScenario {
    fn active_scenario(&self) -> Arc<dyn InterceptHandler> {
        let handler = match ResponseSet::load(&self.path) {
            Ok(set) => {
                let handler = Arc::new(CannedHandler::new(set));
                *self.current.write() = Arc::clone(&handler);
                handler
            }
            Err(e) => {
                tracing::warn!("Keeping previous responses: {:#}", e);
                Arc::clone(&*self.current.read())
            }
        };
        handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use httpintercept_proxy::Protocol;
    use hyper::Request;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn request(method: &str, host: &str, path: &str) -> InterceptRequest {
        InterceptRequest {
            protocol: Protocol::Http,
            local_port: 8080,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
            request: Request::builder()
                .method(method)
                .uri(path)
                .header("Host", host)
                .body(Bytes::new())
                .unwrap(),
        }
    }

    async fn body_of(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const FILE: &str = r#"{
        "responses": [
            { "path": "/health", "method": "GET", "body": "up",
              "headers": { "Content-Type": "text/plain" } },
            { "path": "/api", "host": "api.example.test", "status": 201, "body": "created" }
        ],
        "fallback": { "status": 404, "body": "missing" }
    }"#;

    #[tokio::test]
    async fn matches_method_host_and_path() {
        let set: ResponseSet = serde_json::from_str(FILE).unwrap();
        let handler = CannedHandler::new(set);

        let response = handler.handle(request("GET", "x", "/health")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(body_of(response).await, "up");

        let response = handler
            .handle(request("POST", "api.example.test:8443", "/api"))
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let response = handler.handle(request("POST", "x", "/health")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(body_of(response).await, "missing");

        let response = handler.handle(request("GET", "other.test", "/api")).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn without_fallback_uses_default_page() {
        let handler = CannedHandler::new(ResponseSet::default());
        let response = handler.handle(request("GET", "x", "/anything")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(body_of(response).await.starts_with("httpintercept: GET /anything"));
    }

    #[tokio::test]
    async fn reload_picks_up_edits_and_survives_bad_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("responses.json");
        std::fs::write(&path, FILE).unwrap();
        let source = ResponseFileScenario::open(&path).unwrap();

        let first = source.active_scenario();
        assert_eq!(first.handle(request("GET", "x", "/health")).await.unwrap().status(), 200);

        std::fs::write(&path, r#"{ "responses": [ { "path": "/health", "status": 503 } ] }"#)
            .unwrap();
        let second = source.active_scenario();
        assert_eq!(second.handle(request("GET", "x", "/health")).await.unwrap().status(), 503);

        std::fs::write(&path, "{ not json").unwrap();
        let third = source.active_scenario();
        assert_eq!(third.handle(request("GET", "x", "/health")).await.unwrap().status(), 503);
    }

    #[test]
    fn host_port_is_ignored() {
        assert_eq!(strip_port("example.test:8080"), "example.test");
        assert_eq!(strip_port("example.test"), "example.test");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn open_requires_valid_file() {
        let temp = TempDir::new().unwrap();
        assert!(ResponseFileScenario::open(temp.path().join("missing.json")).is_err());

        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ResponseSet::load(&path).unwrap_err();
        assert!(err.to_string().starts_with("Invalid response file"));
        assert!(err.downcast_ref::<serde_json::Error>().is_some());
    }
}
