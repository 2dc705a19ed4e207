//! HTTP Intercept Proxy - HTTP/HTTPS interception server with port multiplexing.
//!
//! This crate serves canned or scripted responses to HTTP and HTTPS clients.
//! A port listed as both HTTP and HTTPS is served by a multiplexer that peeks
//! at the first byte of each connection and relays it to a loopback-only
//! HTTP or HTTPS listener.
//!
//! ## Features
//!
//! - Root CA loaded from a fixed per-user location (created by the CLI)
//! - Server certificate issued on every start for all local addresses and
//!   configured domains
//! - HTTP and HTTPS listeners with per-connection isolation and a request timeout
//! - Port multiplexing via `MSG_PEEK` and a transparent byte relay
//! - Ordered start/stop with rollback on failure and lifecycle hooks
//! - Live scenario reload without dropping connections
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────► HTTP listener  :9000
//! InterceptServer ─────┤
//!                      │                 ┌─► HTTP listener  127.0.0.1:18080
//!                      └─► Multiplexer ──┤
//!                            :8080       └─► HTTPS listener 127.0.0.1:19080
//!                                                 │
//!                                                 ▼
//!                                         InterceptHandler
//! ```

mod addresses;
mod ca;
mod config;
mod error;
mod issuer;
mod listener;
mod multiplex;
mod net;
mod ports;
mod relay;
pub mod scenario;
mod server;

#[cfg(test)]
mod testing;

pub use addresses::{AddressRegistry, AllowedDomains, StaticAddressRegistry, SystemAddressRegistry};
pub use ca::{CertificateAuthority, RootCa, CA_COMMON_NAME};
pub use config::{
    default_data_dir, InterceptConfig, RelaySettings, DEFAULT_CERTIFICATE_NAME,
    DEFAULT_HTTPS_SHADOW_OFFSET, DEFAULT_HTTP_SHADOW_OFFSET,
};
pub use error::{CertificateError, HookError, PortError, Result, ServerError};
pub use issuer::{CertificateMaterial, ServerCertificateIssuer};
pub use listener::{ListenerService, Protocol};
pub use multiplex::{classify, Backends, MultiplexListener, TLS_HANDSHAKE_RECORD};
pub use ports::{check_port_privileges, PortPlan, ShadowPorts};
pub use relay::{relay, RelayStats};
pub use scenario::{
    DefaultHandler, InterceptHandler, InterceptRequest, ResponseBody, ScenarioSource,
    StaticScenario,
};
pub use server::{InterceptServer, LifecycleHooks, NoHooks, ServerState};
