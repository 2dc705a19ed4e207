//! Root certificate authority management.
//!
//! The root CA is long-lived: it is created once (explicitly, never as a side
//! effect of starting the server), imported into client trust stores, and then
//! used to sign the short-lived server certificates.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::config::default_data_dir;
use crate::error::CertificateError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "root_ca.crt";
const CA_KEY_FILENAME: &str = "root_ca.key";

/// Common name written into generated root CAs.
pub const CA_COMMON_NAME: &str = "HTTP Intercept Root CA";

/// Root CA validity (10 years).
const CA_VALIDITY_DAYS: i64 = 3650;

/// Loaded root CA: signing key, certificate and where they live on disk.
pub struct RootCa {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

impl RootCa {
    /// Returns the issuer used to sign server certificates.
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Returns the CA certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns the CA certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the CA certificate path.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Returns the CA private key path.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

/// Locates, loads and (on request) creates the root CA.
///
/// Loaded material is cached for the lifetime of this value.
#[derive(Debug)]
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    cached: Mutex<Option<Arc<RootCa>>>,
}

impl CertificateAuthority {
    /// Creates a CA manager rooted at the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            cached: Mutex::new(None),
        }
    }

    /// Creates a CA manager using the default data directory.
    pub fn with_default_dir() -> Result<Self, CertificateError> {
        let data_dir = default_data_dir().ok_or_else(|| {
            CertificateError::Generation("Failed to determine data directory".into())
        })?;
        Ok(Self::new(data_dir.join("ca")))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks whether both the CA certificate and key are present.
    pub fn check_ca_exists(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    /// Loads the CA, reading it from disk only on first use.
    pub fn get_ca(&self) -> Result<Arc<RootCa>, CertificateError> {
        let mut cached = self.cached.lock();
        if let Some(ca) = cached.as_ref() {
            return Ok(Arc::clone(ca));
        }

        let ca = Arc::new(self.load()?);
        tracing::debug!("Loaded root CA from {:?}", ca.cert_path);
        *cached = Some(Arc::clone(&ca));
        Ok(ca)
    }

    fn load(&self) -> Result<RootCa, CertificateError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        for path in [&cert_path, &key_path] {
            if !path.is_file() {
                return Err(CertificateError::NotFound(path.clone()));
            }
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::Parse("No certificate found in CA PEM".into()))?
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        Ok(RootCa {
            issuer,
            cert_der,
            cert_pem,
            cert_path,
            key_path,
        })
    }

    /// Generates a new root CA, replacing any existing one.
    ///
    /// Clients must re-import the new certificate afterwards.
    pub fn generate_ca(&self, common_name: &str) -> Result<Arc<RootCa>, CertificateError> {
        fs::create_dir_all(&self.ca_dir)?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "HTTP Intercept");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key_pair =
            KeyPair::generate().map_err(|e| CertificateError::Generation(e.to_string()))?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::Generation(e.to_string()))?;

        let cert_pem = cert.pem();
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        fs::write(&cert_path, &cert_pem).map_err(|e| CertificateError::Write(e.to_string()))?;
        write_private(&key_path, &key_pair.serialize_pem())?;

        tracing::info!("Generated new root CA certificate at {:?}", cert_path);

        let ca = Arc::new(RootCa {
            cert_der: cert.der().clone(),
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            cert_path,
            key_path,
        });
        *self.cached.lock() = Some(Arc::clone(&ca));
        Ok(ca)
    }
}

/// Writes key material readable by the owner only.
pub(crate) fn write_private(path: &Path, contents: &str) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|e| CertificateError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CertificateError::Write(e.to_string()))?;
    }

    Ok(())
}
