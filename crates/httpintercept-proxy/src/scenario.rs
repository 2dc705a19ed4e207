//! Interface to the request handling collaborator.
//!
//! Listeners terminate HTTP (or TLS + HTTP), collect each request and hand it
//! to the active [`InterceptHandler`]. Which handler is active is decided by a
//! [`ScenarioSource`], consulted when a listener starts and on every reload.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Response};

use crate::error::HookError;
use crate::listener::Protocol;

/// Response body type produced by handlers.
pub type ResponseBody = Full<Bytes>;

/// A fully read request together with where it arrived.
#[derive(Debug)]
pub struct InterceptRequest {
    /// Protocol the request arrived over.
    pub protocol: Protocol,
    /// Local port of the listener that accepted it.
    pub local_port: u16,
    /// Remote peer (the multiplexer for shadow listeners).
    pub peer_addr: SocketAddr,
    /// The request with its collected body.
    pub request: Request<Bytes>,
}

/// Handles intercepted requests.
#[async_trait]
pub trait InterceptHandler: Send + Sync {
    /// Produces the response for one request.
    ///
    /// Errors are turned into `500 Internal Server Error` and logged.
    async fn handle(&self, request: InterceptRequest) -> Result<Response<ResponseBody>, HookError>;
}

/// Provides the currently active handler.
pub trait ScenarioSource: Send + Sync {
    /// Returns the handler new requests should use.
    fn active_scenario(&self) -> Arc<dyn InterceptHandler>;
}

impl<F> ScenarioSource for F
where
    F: Fn() -> Arc<dyn InterceptHandler> + Send + Sync,
{
    fn active_scenario(&self) -> Arc<dyn InterceptHandler> {
        self()
    }
}

/// A source that always returns the same handler.
#[derive(Clone)]
pub struct StaticScenario {
    handler: Arc<dyn InterceptHandler>,
}

impl StaticScenario {
    /// Creates a source for `handler`.
    pub fn new(handler: impl InterceptHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl Default for StaticScenario {
    fn default() -> Self {
        Self::new(DefaultHandler)
    }
}

impl ScenarioSource for StaticScenario {
    fn active_scenario(&self) -> Arc<dyn InterceptHandler> {
        Arc::clone(&self.handler)
    }
}

/// Answers every request with a short plain-text description of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

#[async_trait]
impl InterceptHandler for DefaultHandler {
    async fn handle(&self, request: InterceptRequest) -> Result<Response<ResponseBody>, HookError> {
        let body = format!(
            "httpintercept: {} {} via {} on port {}\n",
            request.request.method(),
            request.request.uri().path(),
            request.protocol,
            request.local_port
        );
        Ok(Response::builder()
            .status(200)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(body)))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(path: &str) -> InterceptRequest {
        InterceptRequest {
            protocol: Protocol::Https,
            local_port: 8443,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 50000)),
            request: Request::builder().uri(path).body(Bytes::new()).unwrap(),
        }
    }

    #[tokio::test]
    async fn default_handler_describes_request() {
        let response = DefaultHandler.handle(request("/status")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"httpintercept: GET /status via https on port 8443\n");
    }

    #[test]
    fn closure_source_is_consulted_each_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = move || -> Arc<dyn InterceptHandler> {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(DefaultHandler)
        };

        source.active_scenario();
        source.active_scenario();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
