//! Server configuration.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Default shadow offset for the HTTP side of a multiplexed port.
pub const DEFAULT_HTTP_SHADOW_OFFSET: u16 = 10000;

/// Default shadow offset for the HTTPS side of a multiplexed port.
pub const DEFAULT_HTTPS_SHADOW_OFFSET: u16 = 11000;

/// Default friendly name for generated server certificates.
pub const DEFAULT_CERTIFICATE_NAME: &str = "HTTP Intercept";

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("", "httpintercept", "HTTPIntercept"));

/// Returns the per-user data directory (`<data_dir>/ca`, `<data_dir>/certs`, `<data_dir>/logs`).
pub fn default_data_dir() -> Option<PathBuf> {
    PROJECT_DIRS.as_ref().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Configuration consumed by [`InterceptServer`](crate::InterceptServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Ports served as plaintext HTTP.
    pub http_ports: BTreeSet<u16>,
    /// Ports served as HTTPS.
    pub https_ports: BTreeSet<u16>,
    /// Address public (non-shadow) ports bind to.
    pub bind_address: IpAddr,
    /// Explicit server certificate; disables generation when set with `ssl_key_path`.
    pub ssl_cert_path: Option<PathBuf>,
    /// Explicit server private key.
    pub ssl_key_path: Option<PathBuf>,
    /// Added to a multiplexed port to get its loopback HTTP backend.
    pub http_shadow_offset: u16,
    /// Added to a multiplexed port to get its loopback HTTPS backend.
    pub https_shadow_offset: u16,
    /// Extra SAN entries beyond the local machine's addresses.
    pub allowed_domains: Vec<String>,
    /// Friendly name (CN) of generated server certificates.
    pub certificate_name: String,
    /// Root CA directory (defaults to `<data_dir>/ca`).
    pub ca_dir: Option<PathBuf>,
    /// Generated server certificate directory (defaults to `<data_dir>/certs`).
    pub cert_dir: Option<PathBuf>,
    /// Per-request handling timeout; `None` disables it.
    pub request_timeout_secs: Option<u64>,
    /// Time a client has to send a complete request head; `None` disables it.
    pub header_read_timeout_secs: Option<u64>,
    /// Relayed connections with no traffic for this long are closed.
    pub relay_idle_timeout_secs: u64,
    /// Time a multiplexed client has to send its first byte.
    pub peek_timeout_secs: u64,
    /// Time allowed to connect to a shadow backend.
    pub backend_connect_timeout_secs: u64,
    /// Refuse low ports when the process lacks privileges to bind them.
    pub enforce_port_privileges: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            http_ports: BTreeSet::from([80]),
            https_ports: BTreeSet::from([443]),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ssl_cert_path: None,
            ssl_key_path: None,
            http_shadow_offset: DEFAULT_HTTP_SHADOW_OFFSET,
            https_shadow_offset: DEFAULT_HTTPS_SHADOW_OFFSET,
            allowed_domains: Vec::new(),
            certificate_name: DEFAULT_CERTIFICATE_NAME.to_string(),
            ca_dir: None,
            cert_dir: None,
            request_timeout_secs: Some(30),
            header_read_timeout_secs: Some(30),
            relay_idle_timeout_secs: 300,
            peek_timeout_secs: 10,
            backend_connect_timeout_secs: 5,
            enforce_port_privileges: true,
        }
    }
}

impl InterceptConfig {
    /// Sets the HTTP ports.
    pub fn with_http_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.http_ports = ports.into_iter().collect();
        self
    }

    /// Sets the HTTPS ports.
    pub fn with_https_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.https_ports = ports.into_iter().collect();
        self
    }

    /// Sets the public bind address.
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Uses an existing certificate and key instead of generating one.
    pub fn with_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ssl_cert_path = Some(cert.into());
        self.ssl_key_path = Some(key.into());
        self
    }

    /// Sets the shadow port offsets.
    pub fn with_shadow_offsets(mut self, http: u16, https: u16) -> Self {
        self.http_shadow_offset = http;
        self.https_shadow_offset = https;
        self
    }

    /// Sets the root CA directory.
    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(dir.into());
        self
    }

    /// Sets the generated certificate directory.
    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = Some(dir.into());
        self
    }

    /// Adds extra SAN entries.
    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains.extend(domains.into_iter().map(Into::into));
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    /// Sets the request head read timeout.
    pub fn with_header_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.header_read_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    /// Enables or disables the low-port privilege check.
    pub fn with_port_privilege_check(mut self, enforce: bool) -> Self {
        self.enforce_port_privileges = enforce;
        self
    }

    /// Returns true if an explicit certificate and key were supplied.
    pub fn has_explicit_certificate(&self) -> bool {
        self.ssl_cert_path.is_some() && self.ssl_key_path.is_some()
    }

    /// Returns the request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Returns the request head read timeout.
    pub fn header_read_timeout(&self) -> Option<Duration> {
        self.header_read_timeout_secs.map(Duration::from_secs)
    }

    /// Returns the relay settings derived from this configuration.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(self.relay_idle_timeout_secs),
            peek_timeout: Duration::from_secs(self.peek_timeout_secs),
            connect_timeout: Duration::from_secs(self.backend_connect_timeout_secs),
        }
    }

    /// Resolves the root CA directory.
    pub fn resolved_ca_dir(&self) -> Option<PathBuf> {
        self.ca_dir
            .clone()
            .or_else(|| default_data_dir().map(|dir| dir.join("ca")))
    }

    /// Resolves the generated certificate directory.
    pub fn resolved_cert_dir(&self) -> Option<PathBuf> {
        self.cert_dir
            .clone()
            .or_else(|| default_data_dir().map(|dir| dir.join("certs")))
    }
}

/// Timeouts applied by multiplexers to each relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Close the relay after this long without traffic in either direction.
    pub idle_timeout: Duration,
    /// Time the client has to send its first byte.
    pub peek_timeout: Duration,
    /// Time allowed to reach the backend.
    pub connect_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        InterceptConfig::default().relay_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let config = InterceptConfig::default();
        assert_eq!(config.http_ports, BTreeSet::from([80]));
        assert_eq!(config.https_ports, BTreeSet::from([443]));
        assert_eq!(config.http_shadow_offset, 10000);
        assert_eq!(config.https_shadow_offset, 11000);
        assert!(!config.has_explicit_certificate());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: InterceptConfig =
            serde_json::from_str(r#"{"http_ports": [8080, 9000], "https_ports": [8080]}"#)
                .unwrap();
        assert_eq!(config.http_ports, BTreeSet::from([8080, 9000]));
        assert_eq!(config.https_ports, BTreeSet::from([8080]));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.header_read_timeout(), Some(Duration::from_secs(30)));
        assert!(config.enforce_port_privileges);
    }

    #[test]
    fn builder_helpers() {
        let config = InterceptConfig::default()
            .with_http_ports([8080])
            .with_https_ports(std::iter::empty())
            .with_certificate("/tmp/server.crt", "/tmp/server.key")
            .with_request_timeout(None)
            .with_allowed_domains(["example.test"]);
        assert!(config.https_ports.is_empty());
        assert!(config.has_explicit_certificate());
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.allowed_domains, vec!["example.test".to_string()]);
    }

    #[test]
    fn explicit_dirs_win_over_defaults() {
        let config = InterceptConfig::default().with_ca_dir("/srv/ca");
        assert_eq!(config.resolved_ca_dir(), Some(PathBuf::from("/srv/ca")));
    }
}
