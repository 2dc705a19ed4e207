//! HTTP and HTTPS listeners.
//!
//! A [`ListenerService`] owns one bound socket. Every accepted connection runs
//! in its own task: HTTPS connections complete a TLS handshake first, then
//! hyper parses requests and hands each one, body collected, to the active
//! [`InterceptHandler`].

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::RwLock;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::error::{HookError, Result};
use crate::net::{bind_listener, AcceptLoop};
use crate::scenario::{InterceptHandler, InterceptRequest, ResponseBody, ScenarioSource};

/// Time a client has to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a client has to send a request head unless configured otherwise.
const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Application protocol served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plaintext HTTP/1.1.
    Http,
    /// HTTP/1.1 over TLS.
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// State shared between a listener and its connection tasks.
struct ListenerShared {
    protocol: Protocol,
    local_port: u16,
    source: Arc<dyn ScenarioSource>,
    handler: RwLock<Arc<dyn InterceptHandler>>,
    request_timeout: RwLock<Option<Duration>>,
    header_read_timeout: RwLock<Option<Duration>>,
}

/// A bound HTTP or HTTPS listener.
pub struct ListenerService {
    shared: Arc<ListenerShared>,
    accept_loop: AcceptLoop,
}

impl fmt::Debug for ListenerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerService")
            .field("protocol", &self.shared.protocol)
            .field("local_addr", &self.accept_loop.local_addr())
            .field("request_timeout", &*self.shared.request_timeout.read())
            .field("header_read_timeout", &*self.shared.header_read_timeout.read())
            .finish()
    }
}

impl ListenerService {
    /// Binds a plaintext HTTP listener on `addr`.
    pub fn bind_http(
        addr: SocketAddr,
        source: Arc<dyn ScenarioSource>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::bind(addr, None, source, request_timeout)
    }

    /// Binds an HTTPS listener on `addr` presenting the certificate in `tls`.
    pub fn bind_https(
        addr: SocketAddr,
        tls: Arc<ServerConfig>,
        source: Arc<dyn ScenarioSource>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::bind(addr, Some(TlsAcceptor::from(tls)), source, request_timeout)
    }

    fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        source: Arc<dyn ScenarioSource>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let protocol = if tls.is_some() {
            Protocol::Https
        } else {
            Protocol::Http
        };
        let listener = bind_listener(addr)?;
        let local_port = listener.local_addr()?.port();

        let shared = Arc::new(ListenerShared {
            protocol,
            local_port,
            handler: RwLock::new(source.active_scenario()),
            source,
            request_timeout: RwLock::new(request_timeout),
            header_read_timeout: RwLock::new(Some(DEFAULT_HEADER_READ_TIMEOUT)),
        });

        let conn_shared = Arc::clone(&shared);
        let role = match protocol {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        };
        let accept_loop = AcceptLoop::spawn(listener, role, move |stream, peer| {
            serve_connection(stream, peer, tls.clone(), Arc::clone(&conn_shared))
        })?;

        tracing::info!("{} listener bound on {}", role, accept_loop.local_addr());
        Ok(Self {
            shared,
            accept_loop,
        })
    }

    /// Returns the protocol this listener serves.
    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.accept_loop.local_addr()
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.shared.local_port
    }

    /// Re-reads the active handler from the scenario source.
    ///
    /// Requests already being handled finish with the previous handler.
    pub fn reload_active_scenario(&self) {
        let handler = self.shared.source.active_scenario();
        *self.shared.handler.write() = handler;
        tracing::debug!(
            "Reloaded scenario for {} listener on port {}",
            self.shared.protocol,
            self.shared.local_port
        );
    }

    /// Returns the timeout applied to each handler call.
    pub fn request_timeout(&self) -> Option<Duration> {
        *self.shared.request_timeout.read()
    }

    /// Sets the timeout applied to each handler call; `None` disables it.
    pub fn set_request_timeout(&self, timeout: Option<Duration>) {
        *self.shared.request_timeout.write() = timeout;
    }

    /// Returns the time a connection may take to send each request head.
    pub fn header_read_timeout(&self) -> Option<Duration> {
        *self.shared.header_read_timeout.read()
    }

    /// Sets the request head timeout for new connections; `None` disables it.
    ///
    /// The timer also runs while a keep-alive connection waits for its next
    /// request, so idle clients are disconnected.
    pub fn set_header_read_timeout(&self, timeout: Option<Duration>) {
        *self.shared.header_read_timeout.write() = timeout;
    }

    /// Stops accepting and closes the socket and all open connections.
    pub async fn stop(self) {
        let addr = self.local_addr();
        self.accept_loop.stop().await;
        tracing::info!("{} listener on {} stopped", self.shared.protocol, addr);
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    shared: Arc<ListenerShared>,
) {
    let _ = stream.set_nodelay(true);

    match tls {
        None => serve_http(stream, peer, shared).await,
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => serve_http(tls_stream, peer, shared).await,
                Ok(Err(e)) => tracing::debug!("TLS handshake with {} failed: {}", peer, e),
                Err(_) => tracing::debug!("TLS handshake with {} timed out", peer),
            }
        }
    }
}

async fn serve_http<I>(io: I, peer: SocketAddr, shared: Arc<ListenerShared>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let header_read_timeout = *shared.header_read_timeout.read();
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { Ok::<_, Infallible>(dispatch(req, peer, shared).await) }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(header_read_timeout)
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        tracing::debug!("Connection from {} closed with error: {}", peer, e);
    }
}

/// Runs one request through the active handler.
async fn dispatch(
    req: Request<Incoming>,
    peer: SocketAddr,
    shared: Arc<ListenerShared>,
) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!("Failed to read request body from {}: {}", peer, e);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let request = InterceptRequest {
        protocol: shared.protocol,
        local_port: shared.local_port,
        peer_addr: peer,
        request: Request::from_parts(parts, body),
    };
    let handler = Arc::clone(&*shared.handler.read());
    let timeout = *shared.request_timeout.read();

    // Handlers run in their own task so a panic becomes a 500 instead of a dropped connection.
    let mut task = HandlerTask(tokio::spawn(async move { handler.handle(request).await }));
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Request from {} exceeded {:?}", peer, limit);
                return status_response(StatusCode::GATEWAY_TIMEOUT);
            }
        },
        None => (&mut task.0).await,
    };

    match joined {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!("Handler failed for request from {}: {}", peer, e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            tracing::error!("Handler task for request from {} failed: {}", peer, e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Aborts the handler when the request is abandoned.
struct HandlerTask(JoinHandle<std::result::Result<Response<ResponseBody>, HookError>>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", status))));
    *response.status_mut() = status;
    response
}
