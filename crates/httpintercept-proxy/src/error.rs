//! Error types for the intercept server.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::server::ServerState;

/// Boxed error returned by lifecycle hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Intercept server error type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No root CA was found; clients would not trust a certificate it signed.
    #[error(
        "root CA not found (expected {cert_path:?} and {key_path:?}); \
         create one with `httpintercept ca create` and import it into your clients"
    )]
    MissingRootCa {
        /// Expected CA certificate path.
        cert_path: PathBuf,
        /// Expected CA private key path.
        key_path: PathBuf,
    },

    /// Certificate error.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Port configuration error.
    #[error("Port configuration error: {0}")]
    Ports(#[from] PortError),

    /// Failed to bind a listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("cannot {operation} while server is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the server was in.
        state: ServerState,
    },

    /// A lifecycle hook failed and aborted the transition.
    #[error("{stage} hook failed: {source}")]
    Hook {
        /// Hook name.
        stage: &'static str,
        /// Error raised by the hook.
        #[source]
        source: HookError,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority and issuance errors.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Expected certificate or key file is missing.
    #[error("certificate material not found: {0:?}")]
    NotFound(PathBuf),

    /// Failed to generate a certificate or key.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read certificate material.
    #[error("Failed to read certificate: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse certificate material.
    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    /// Failed to write certificate material.
    #[error("Failed to write certificate: {0}")]
    Write(String),

    /// Encrypted private key output was requested.
    #[error("passphrase-protected server keys are not supported")]
    UnsupportedPassphrase,
}

/// Port set validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Neither HTTP nor HTTPS ports were configured.
    #[error("no HTTP or HTTPS ports configured")]
    Empty,

    /// Port 0 cannot be served.
    #[error("port 0 is not a valid listening port")]
    ZeroPort,

    /// A shadow port would exceed 65535.
    #[error("port {port} cannot be multiplexed: shadow port {port} + {offset} exceeds 65535")]
    ShadowOverflow {
        /// Multiplexed public port.
        port: u16,
        /// Offset that overflowed.
        offset: u16,
    },

    /// A shadow port collides with another configured or shadow port.
    #[error("shadow port {shadow} for multiplexed port {port} collides with another port")]
    Collision {
        /// Multiplexed public port.
        port: u16,
        /// Colliding shadow port.
        shadow: u16,
    },

    /// HTTP and HTTPS shadow offsets are equal.
    #[error("HTTP and HTTPS shadow offsets must differ (both {0})")]
    EqualOffsets(u16),

    /// The process may not bind the requested low ports.
    #[error("insufficient privileges to bind ports {ports:?}; run as root or choose ports above the privileged range")]
    InsufficientPrivileges {
        /// Ports that require elevated privileges.
        ports: Vec<u16>,
    },
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
