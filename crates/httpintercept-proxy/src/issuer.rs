//! Server certificate issuance.
//!
//! Every server start produces one certificate covering all allowed domains,
//! signed by the root CA and written over the previous one.

use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::ca::{write_private, RootCa};
use crate::error::{CertificateError, ServerError};

/// Server certificate and key file names.
const SERVER_CERT_FILENAME: &str = "server.crt";
const SERVER_KEY_FILENAME: &str = "server.key";

/// Server certificate validity in days.
const SERVER_VALIDITY_DAYS: i64 = 30;

/// Offset for not_before to tolerate client clock skew (seconds).
const NOT_BEFORE_OFFSET: i64 = 60;

/// A server certificate chain and key ready for TLS listeners.
pub struct CertificateMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_path: PathBuf,
    key_path: PathBuf,
    domains: Vec<String>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("chain_len", &self.chain.len())
            .field("domains", &self.domains)
            .finish()
    }
}

impl CertificateMaterial {
    /// Loads an existing PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        for path in [cert_path, key_path] {
            if !path.is_file() {
                return Err(CertificateError::NotFound(path.to_path_buf()));
            }
        }

        let mut cert_reader = BufReader::new(fs::File::open(cert_path)?);
        let chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        if chain.is_empty() {
            return Err(CertificateError::Parse(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }

        let mut key_reader = BufReader::new(fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| CertificateError::Parse(e.to_string()))?
            .ok_or_else(|| {
                CertificateError::Parse(format!("no private key in {}", key_path.display()))
            })?;

        Ok(Self {
            chain,
            key,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            domains: Vec::new(),
        })
    }

    /// Returns the certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Returns the certificate path.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Returns the private key path.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Returns the SAN entries the certificate was issued for.
    ///
    /// Empty for certificates loaded from explicit paths.
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Builds the rustls configuration shared by all HTTPS listeners.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, ServerError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Issues server certificates signed by a [`RootCa`].
#[derive(Debug, Clone)]
pub struct ServerCertificateIssuer {
    cert_dir: PathBuf,
}

impl ServerCertificateIssuer {
    /// Creates an issuer writing into `cert_dir`.
    pub fn new(cert_dir: impl AsRef<Path>) -> Self {
        Self {
            cert_dir: cert_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the path generated certificates are written to.
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(SERVER_CERT_FILENAME)
    }

    /// Returns the path generated keys are written to.
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(SERVER_KEY_FILENAME)
    }

    /// Generates and persists a server certificate for `sans`.
    ///
    /// Entries that are neither an IP address nor a valid DNS name are skipped.
    /// The previous certificate at the same path is overwritten.
    pub fn generate_config_certificates<I, S>(
        &self,
        ca: &RootCa,
        friendly_name: &str,
        sans: I,
        passphrase: Option<&str>,
    ) -> Result<CertificateMaterial, CertificateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if passphrase.is_some() {
            return Err(CertificateError::UnsupportedPassphrase);
        }

        let mut params = CertificateParams::default();
        params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, friendly_name);
        params.distinguished_name = dn;

        let mut domains = Vec::new();
        for entry in sans {
            let entry = entry.as_ref().trim();
            if let Some(san) = parse_san(entry) {
                params.subject_alt_names.push(san);
                domains.push(entry.to_string());
            } else if !entry.is_empty() {
                tracing::warn!("Skipping invalid certificate SAN entry {:?}", entry);
            }
        }
        if domains.is_empty() {
            tracing::warn!("Issuing server certificate without any SAN entries");
        }

        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
        params.not_after = now + Duration::days(SERVER_VALIDITY_DAYS);

        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, ca.issuer())
            .map_err(|e| CertificateError::Generation(e.to_string()))?;

        fs::create_dir_all(&self.cert_dir)?;
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        // Leaf first, then the CA, so clients can build the chain.
        let chain_pem = format!("{}{}", cert.pem(), ca.cert_pem());
        fs::write(&cert_path, chain_pem).map_err(|e| CertificateError::Write(e.to_string()))?;
        write_private(&key_path, &key_pair.serialize_pem())?;

        tracing::info!(
            "Generated server certificate {:?} for {} domain(s)",
            cert_path,
            domains.len()
        );

        Ok(CertificateMaterial {
            chain: vec![cert.der().clone(), ca.cert_der().clone()],
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
            cert_path,
            key_path,
            domains,
        })
    }
}

/// Converts an allow-list entry into a SAN, if it is usable as one.
fn parse_san(entry: &str) -> Option<SanType> {
    if entry.is_empty() {
        return None;
    }
    if let Ok(ip) = entry.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Some(SanType::IpAddress(ip));
    }
    if !is_dns_name(entry) {
        return None;
    }
    entry.try_into().ok().map(SanType::DnsName)
}

/// RFC 1123 host name check, allowing a leading `*.` wildcard label.
fn is_dns_name(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}
