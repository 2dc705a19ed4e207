//! The intercept server orchestrator.
//!
//! [`InterceptServer`] turns an [`InterceptConfig`] into running listeners:
//!
//! 1. plan ports (dedicated vs. multiplexed) and check privileges,
//! 2. prepare the server certificate if anything speaks TLS,
//! 3. bind HTTP listeners, then HTTPS listeners, then multiplexers.
//!
//! `stop()` tears them down in reverse. Start and stop are serialized, and a
//! failed start leaves nothing bound.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::addresses::{AddressRegistry, AllowedDomains, SystemAddressRegistry};
use crate::ca::CertificateAuthority;
use crate::config::InterceptConfig;
use crate::error::{CertificateError, HookError, Result, ServerError};
use crate::issuer::{CertificateMaterial, ServerCertificateIssuer};
use crate::listener::ListenerService;
use crate::multiplex::{Backends, MultiplexListener};
use crate::ports::{check_port_privileges, PortPlan, ShadowPorts};
use crate::scenario::{ScenarioSource, StaticScenario};

/// Shadow listeners only ever bind loopback.
const SHADOW_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Lifecycle state of an [`InterceptServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Nothing is bound.
    Stopped,
    /// `start()` is in progress.
    Starting,
    /// All listeners are bound and serving.
    Running,
    /// `stop()` is in progress.
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Extension points around start and stop.
///
/// An error from any hook aborts the transition it belongs to and is returned
/// to the caller as [`ServerError::Hook`].
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs before anything is bound. An error leaves the server stopped.
    async fn pre_start_tasks(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }

    /// Runs once every listener is bound. An error stops the server again.
    async fn post_start_tasks(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }

    /// Runs before listeners are torn down. An error keeps the server running.
    async fn pre_stop_tasks(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }

    /// Runs after everything is closed.
    async fn post_stop_tasks(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Listeners owned by a running server.
#[derive(Debug, Default)]
struct RunningListeners {
    plan: PortPlan,
    http: BTreeMap<u16, ListenerService>,
    https: BTreeMap<u16, ListenerService>,
    multiplexers: BTreeMap<u16, MultiplexListener>,
}

impl RunningListeners {
    fn listeners(&self) -> impl Iterator<Item = &ListenerService> {
        self.http.values().chain(self.https.values())
    }

    fn bound_ports(&self) -> BTreeSet<u16> {
        self.http
            .keys()
            .chain(self.https.keys())
            .chain(self.multiplexers.keys())
            .copied()
            .collect()
    }

    /// Stops multiplexers, then HTTPS listeners, then HTTP listeners.
    async fn shutdown(self) {
        for (_, mux) in self.multiplexers {
            mux.stop().await;
        }
        for (_, listener) in self.https {
            listener.stop().await;
        }
        for (_, listener) in self.http {
            listener.stop().await;
        }
    }
}

/// Serves the configured HTTP and HTTPS ports.
pub struct InterceptServer {
    config: InterceptConfig,
    addresses: Arc<dyn AddressRegistry>,
    ca: Arc<CertificateAuthority>,
    issuer: ServerCertificateIssuer,
    scenarios: Arc<dyn ScenarioSource>,
    hooks: Arc<dyn LifecycleHooks>,
    state: RwLock<ServerState>,
    running: Mutex<Option<RunningListeners>>,
    allowed_domains: RwLock<AllowedDomains>,
    certificate: RwLock<Option<Arc<CertificateMaterial>>>,
    request_timeout: RwLock<Option<Duration>>,
}

impl fmt::Debug for InterceptServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptServer")
            .field("config", &self.config)
            .field("ca_dir", &self.ca.ca_dir())
            .field("state", &*self.state.read())
            .field("request_timeout", &*self.request_timeout.read())
            .finish()
    }
}

impl InterceptServer {
    /// Creates a stopped server for `config`.
    ///
    /// Uses the system address registry, the CA in the configured (or default)
    /// directory and the [`DefaultHandler`](crate::DefaultHandler).
    pub fn new(config: InterceptConfig) -> Result<Self> {
        let ca_dir = config.resolved_ca_dir().ok_or_else(|| {
            CertificateError::Generation("Failed to determine CA directory".into())
        })?;
        let cert_dir = config.resolved_cert_dir().ok_or_else(|| {
            CertificateError::Generation("Failed to determine certificate directory".into())
        })?;

        Ok(Self {
            addresses: Arc::new(SystemAddressRegistry::new()),
            ca: Arc::new(CertificateAuthority::new(ca_dir)),
            issuer: ServerCertificateIssuer::new(cert_dir),
            scenarios: Arc::new(StaticScenario::default()),
            hooks: Arc::new(NoHooks),
            state: RwLock::new(ServerState::Stopped),
            running: Mutex::new(None),
            allowed_domains: RwLock::new(AllowedDomains::new()),
            certificate: RwLock::new(None),
            request_timeout: RwLock::new(config.request_timeout()),
            config,
        })
    }

    /// Replaces the local address registry used for certificate SANs.
    pub fn with_address_registry(mut self, registry: Arc<dyn AddressRegistry>) -> Self {
        self.addresses = registry;
        self
    }

    /// Shares an existing certificate authority.
    pub fn with_certificate_authority(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = ca;
        self
    }

    /// Sets the source of the active request handler.
    pub fn with_scenario_source(mut self, source: Arc<dyn ScenarioSource>) -> Self {
        self.scenarios = source;
        self
    }

    /// Sets the lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    /// Returns the certificate authority.
    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    fn set_state(&self, state: ServerState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        tracing::debug!("Intercept server {} -> {}", previous, state);
    }

    /// Returns the certificate presented by HTTPS listeners, if one was prepared.
    pub fn certificate(&self) -> Option<Arc<CertificateMaterial>> {
        self.certificate.read().clone()
    }

    /// Returns every host and address server certificates are issued for.
    ///
    /// Merges the local addresses with the configured domains. The set only grows.
    pub fn allowed_https_domains(&self) -> Vec<String> {
        let local = self.addresses.local_addresses();
        let mut domains = self.allowed_domains.write();
        if domains.extend(local.iter().chain(&self.config.allowed_domains)) {
            tracing::debug!("Allowed HTTPS domains now {}", domains.len());
        }
        domains.to_vec()
    }

    /// Starts every listener and returns once they are all bound.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let state = self.state();
        if state != ServerState::Stopped {
            return Err(ServerError::InvalidState {
                operation: "start",
                state,
            });
        }

        self.set_state(ServerState::Starting);
        if let Err(source) = self.hooks.pre_start_tasks().await {
            self.set_state(ServerState::Stopped);
            return Err(ServerError::Hook {
                stage: "pre_start",
                source,
            });
        }

        let listeners = match self.bind_all().await {
            Ok(listeners) => listeners,
            Err(e) => {
                tracing::error!("Failed to start intercept server: {}", e);
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };
        tracing::info!(
            "Intercept server running on {:?} ({} multiplexed)",
            listeners.plan.public_ports().collect::<Vec<_>>(),
            listeners.multiplexers.len()
        );
        *running = Some(listeners);
        self.set_state(ServerState::Running);

        if let Err(source) = self.hooks.post_start_tasks().await {
            if let Some(listeners) = running.take() {
                listeners.shutdown().await;
            }
            self.set_state(ServerState::Stopped);
            return Err(ServerError::Hook {
                stage: "post_start",
                source,
            });
        }
        Ok(())
    }

    async fn bind_all(&self) -> Result<RunningListeners> {
        if self.config.ssl_cert_path.is_some() != self.config.ssl_key_path.is_some() {
            return Err(ServerError::Config(
                "ssl_cert_path and ssl_key_path must be set together".into(),
            ));
        }
        let plan = PortPlan::from_config(&self.config)?;
        if self.config.enforce_port_privileges {
            check_port_privileges(plan.all_ports())?;
        }

        let certificate = if plan.needs_tls() {
            Some(self.prepare_certificate()?)
        } else {
            None
        };
        let tls = certificate
            .as_ref()
            .map(|material| material.server_config())
            .transpose()?;

        let mut listeners = RunningListeners {
            plan: plan.clone(),
            ..Default::default()
        };
        if let Err(e) = self.bind_planned(&plan, tls, &mut listeners) {
            listeners.shutdown().await;
            return Err(e);
        }
        *self.certificate.write() = certificate;
        Ok(listeners)
    }

    fn bind_planned(
        &self,
        plan: &PortPlan,
        tls: Option<Arc<ServerConfig>>,
        listeners: &mut RunningListeners,
    ) -> Result<()> {
        let public = |port: u16| SocketAddr::new(self.config.bind_address, port);
        let shadow = |port: u16| SocketAddr::new(SHADOW_BIND_ADDR, port);
        let timeout = self.request_timeout();
        let header_timeout = self.config.header_read_timeout();

        let http_targets = plan
            .http
            .iter()
            .map(|&p| public(p))
            .chain(plan.multiplexed.values().map(|s| shadow(s.http)));
        for addr in http_targets {
            let listener = ListenerService::bind_http(addr, Arc::clone(&self.scenarios), timeout)?;
            listener.set_header_read_timeout(header_timeout);
            listeners.http.insert(listener.port(), listener);
        }

        let https_targets: Vec<SocketAddr> = plan
            .https
            .iter()
            .map(|&p| public(p))
            .chain(plan.multiplexed.values().map(|s| shadow(s.https)))
            .collect();
        if let Some(tls) = tls.filter(|_| !https_targets.is_empty()) {
            for addr in https_targets {
                let listener = ListenerService::bind_https(
                    addr,
                    Arc::clone(&tls),
                    Arc::clone(&self.scenarios),
                    timeout,
                )?;
                listener.set_header_read_timeout(header_timeout);
                listeners.https.insert(listener.port(), listener);
            }
        }

        let relay = self.config.relay_settings();
        for (&port, ports) in &plan.multiplexed {
            let backends = Backends {
                http: shadow(ports.http),
                https: shadow(ports.https),
            };
            let mux = MultiplexListener::bind(public(port), backends, relay)?;
            listeners.multiplexers.insert(port, mux);
        }
        Ok(())
    }

    /// Loads the explicit certificate or issues a fresh one for the allowed domains.
    fn prepare_certificate(&self) -> Result<Arc<CertificateMaterial>> {
        let material = match (&self.config.ssl_cert_path, &self.config.ssl_key_path) {
            (Some(cert), Some(key)) => {
                tracing::info!("Using server certificate {:?}", cert);
                CertificateMaterial::from_pem_files(cert, key)?
            }
            _ => {
                if !self.ca.check_ca_exists() {
                    return Err(ServerError::MissingRootCa {
                        cert_path: self.ca.cert_path(),
                        key_path: self.ca.key_path(),
                    });
                }
                let ca = self.ca.get_ca()?;
                let domains = self.allowed_https_domains();
                self.issuer.generate_config_certificates(
                    &ca,
                    &self.config.certificate_name,
                    &domains,
                    None,
                )?
            }
        };

        Ok(Arc::new(material))
    }

    /// Stops every listener, multiplexers first.
    ///
    /// Stopping a stopped server does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let state = self.state();
        match state {
            ServerState::Stopped => return Ok(()),
            ServerState::Running => {}
            _ => {
                return Err(ServerError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }

        self.set_state(ServerState::Stopping);
        if let Err(source) = self.hooks.pre_stop_tasks().await {
            self.set_state(ServerState::Running);
            return Err(ServerError::Hook {
                stage: "pre_stop",
                source,
            });
        }

        if let Some(listeners) = running.take() {
            listeners.shutdown().await;
        }
        self.set_state(ServerState::Stopped);
        tracing::info!("Intercept server stopped");

        self.hooks
            .post_stop_tasks()
            .await
            .map_err(|source| ServerError::Hook {
                stage: "post_stop",
                source,
            })
    }

    /// Starts, waits for `shutdown` and stops.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!("Shutdown requested");
        self.stop().await
    }

    /// Makes every live listener re-read the active scenario.
    ///
    /// Open connections are kept. Returns the number of listeners reloaded.
    pub async fn reload_config(&self) -> usize {
        let running = self.running.lock().await;
        let Some(listeners) = running.as_ref() else {
            return 0;
        };

        let mut reloaded = 0;
        for listener in listeners.listeners() {
            listener.reload_active_scenario();
            reloaded += 1;
        }
        tracing::info!("Reloaded scenario on {} listener(s)", reloaded);
        reloaded
    }

    /// Returns the request timeout applied by every listener.
    pub fn request_timeout(&self) -> Option<Duration> {
        *self.request_timeout.read()
    }

    /// Sets the request timeout and pushes it to every live listener.
    pub async fn set_request_timeout(&self, timeout: Option<Duration>) {
        *self.request_timeout.write() = timeout;
        let running = self.running.lock().await;
        if let Some(listeners) = running.as_ref() {
            for listener in listeners.listeners() {
                listener.set_request_timeout(timeout);
            }
        }
    }

    /// Returns every port currently bound, shadow ports included.
    pub async fn bound_ports(&self) -> BTreeSet<u16> {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(RunningListeners::bound_ports)
            .unwrap_or_default()
    }

    /// Returns the shadow ports of each running multiplexer.
    pub async fn shadow_ports(&self) -> BTreeMap<u16, ShadowPorts> {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|listeners| listeners.plan.multiplexed.clone())
            .unwrap_or_default()
    }

    /// Returns the ports served directly by an HTTP listener and by an HTTPS listener.
    pub async fn listener_ports(&self) -> (BTreeSet<u16>, BTreeSet<u16>) {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(listeners) => (
                listeners.http.keys().copied().collect(),
                listeners.https.keys().copied().collect(),
            ),
            None => Default::default(),
        }
    }
}
