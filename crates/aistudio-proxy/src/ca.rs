//! Certificate Authority management for the intercepting proxy.
//!
//! Keeps a root CA on disk and issues per-host leaf certificates signed by
//! it, so the browser (which trusts the CA) accepts the proxy as the origin.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "ca.crt";
const CA_KEY_FILENAME: &str = "ca.key";

/// Common name of the generated root CA.
const CA_COMMON_NAME: &str = "AI Studio Proxy CA";

/// Validity of the root CA, in days.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity of per-host certificates, in days.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Locations of a host's certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPair {
    /// PEM certificate.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
}

/// Source of TLS identities for intercepted hosts.
pub trait CertificateProvider: Send + Sync {
    /// Ensures a certificate and key exist for `host`. Idempotent.
    fn get_domain_cert(&self, host: &str) -> Result<CertPair, CaManagerError>;

    /// Returns a server TLS config presenting `host`'s certificate.
    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        let pair = self.get_domain_cert(host)?;
        load_server_config(&pair)
    }
}

/// Manages the root CA and the per-host certificates it signs.
#[derive(Debug)]
pub struct CertManager {
    /// Directory holding the CA and every issued certificate.
    cert_dir: PathBuf,
    /// Serializes generation so concurrent connections don't race on files.
    generate_lock: Mutex<()>,
    /// Server configs already built, by host.
    configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertManager {
    /// Creates a new manager rooted at the given directory.
    pub fn new(cert_dir: impl AsRef<Path>) -> Self {
        Self {
            cert_dir: cert_dir.as_ref().to_path_buf(),
            generate_lock: Mutex::new(()),
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the certificate directory.
    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.cert_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn ca_key_path(&self) -> PathBuf {
        self.cert_dir.join(CA_KEY_FILENAME)
    }

    /// Returns the path of `host`'s certificate.
    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.crt", host))
    }

    /// Returns the path of `host`'s private key.
    pub fn key_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.key", host))
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.ca_cert_path().exists() && self.ca_key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary.
    pub fn ensure_ca(&self) -> Result<(), CaManagerError> {
        let _guard = self.generate_lock.lock();
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        Ok(())
    }

    /// Generates a new root CA certificate and key, replacing any existing one.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.cert_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "AI Studio Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.ca_cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.ca_key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.ca_cert_path());

        Ok(())
    }

    /// Loads the CA as an issuer for leaf certificates.
    fn load_issuer(&self) -> Result<Issuer<'static, KeyPair>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.ca_cert_path())?;
        let key_pem = fs::read_to_string(self.ca_key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))
    }

    /// Issues a certificate for `host`, signed by the CA.
    fn generate_leaf(&self, host: &str) -> Result<(), CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        let issuer = self.load_issuer()?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(host), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(host), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Issued certificate for {}", host);

        Ok(())
    }
}

impl CertificateProvider for CertManager {
    fn get_domain_cert(&self, host: &str) -> Result<CertPair, CaManagerError> {
        validate_host(host)?;

        let pair = CertPair {
            cert_path: self.cert_path(host),
            key_path: self.key_path(host),
        };

        let _guard = self.generate_lock.lock();
        if !(pair.cert_path.exists() && pair.key_path.exists()) {
            fs::create_dir_all(&self.cert_dir)?;
            self.generate_leaf(host)?;
        }

        Ok(pair)
    }

    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        if let Some(config) = self.configs.read().get(host) {
            return Ok(config.clone());
        }

        let pair = self.get_domain_cert(host)?;
        let config = load_server_config(&pair)?;
        self.configs.write().insert(host.to_string(), config.clone());
        Ok(config)
    }
}

/// Builds a rustls server config from a PEM certificate and key.
pub fn load_server_config(pair: &CertPair) -> Result<Arc<ServerConfig>, CaManagerError> {
    let certs = load_certs(&pair.cert_path)?;
    let key = load_private_key(&pair.key_path)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| CaManagerError::Parse(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CaManagerError::Parse(e.to_string()))?;

    // The forwarding loops parse HTTP/1.1 framing.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CaManagerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(CaManagerError::Parse(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Reads the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CaManagerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| CaManagerError::Parse(format!("no private key found in {:?}", path)))
}

/// Rejects hosts that would escape the certificate directory.
fn validate_host(host: &str) -> Result<(), CaManagerError> {
    if host.is_empty() || host.contains(['/', '\\']) || host.contains("..") {
        return Err(CaManagerError::InvalidHost(host.to_string()));
    }
    Ok(())
}

/// Sets a validity window starting yesterday, to tolerate clock skew.
fn set_validity(params: &mut CertificateParams, days: i64) {
    let start = Utc::now() - Duration::days(1);
    let end = start + Duration::days(days);
    params.not_before = date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}
