//! Command-line arguments and configuration loading.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use httpintercept_proxy::{default_data_dir, InterceptConfig, CA_COMMON_NAME};

/// Config file looked up in the data directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILENAME: &str = "config.json";

/// HTTP Intercept - serve canned HTTP and HTTPS responses on local ports
#[derive(Parser, Debug)]
#[command(name = "httpintercept", version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the root certificate authority
    Ca {
        #[command(subcommand)]
        action: CaCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create the root CA clients must trust
    Create {
        /// Replace an existing CA
        #[arg(long)]
        force: bool,

        /// Common name of the CA certificate
        #[arg(long, default_value = CA_COMMON_NAME)]
        name: String,
    },
    /// Print the root CA certificate path
    Path,
}

/// Server options; each overrides the config file.
#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// JSON configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Plain HTTP port (repeatable)
    #[arg(long = "http-port", value_name = "PORT")]
    pub http_ports: Vec<u16>,

    /// HTTPS port (repeatable); ports also given as HTTP ports are multiplexed
    #[arg(long = "https-port", value_name = "PORT")]
    pub https_ports: Vec<u16>,

    /// Address public listeners bind to
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Server certificate (PEM); disables certificate generation
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Root CA directory
    #[arg(long, global = true)]
    pub ca_dir: Option<PathBuf>,

    /// Directory for generated server certificates
    #[arg(long)]
    pub cert_dir: Option<PathBuf>,

    /// Extra certificate domain (repeatable)
    #[arg(long = "domain", value_name = "NAME")]
    pub domains: Vec<String>,

    /// Canned response file, reloaded on SIGHUP
    #[arg(long)]
    pub responses: Option<PathBuf>,

    /// Handler timeout in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub request_timeout: Option<u64>,

    /// Skip the low-port privilege check
    #[arg(long)]
    pub no_privilege_check: bool,
}

impl ServeArgs {
    /// Loads the config file (if any) and applies the command-line overrides.
    pub fn to_config(&self) -> anyhow::Result<InterceptConfig> {
        let mut config = match self.config_file() {
            Some(path) => load_config_file(&path)?,
            None => InterceptConfig::default(),
        };

        if !self.http_ports.is_empty() {
            config = config.with_http_ports(self.http_ports.iter().copied());
        }
        if !self.https_ports.is_empty() {
            config = config.with_https_ports(self.https_ports.iter().copied());
        }
        if let Some(bind) = self.bind {
            config = config.with_bind_address(bind);
        }
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            config = config.with_certificate(cert, key);
        }
        if let Some(dir) = &self.ca_dir {
            config = config.with_ca_dir(dir);
        }
        if let Some(dir) = &self.cert_dir {
            config = config.with_cert_dir(dir);
        }
        config = config.with_allowed_domains(self.domains.iter().cloned());
        if let Some(secs) = self.request_timeout {
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            config = config.with_request_timeout(timeout);
        }
        if self.no_privilege_check {
            config = config.with_port_privilege_check(false);
        }
        Ok(config)
    }

    /// Explicit `--config`, or the default file when it exists.
    fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            default_data_dir()
                .map(|dir| dir.join(DEFAULT_CONFIG_FILENAME))
                .filter(|path| path.is_file())
        })
    }
}

/// Reads an [`InterceptConfig`] from a JSON file.
pub fn load_config_file(path: &Path) -> anyhow::Result<InterceptConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}
