//! Certificate providers for the client-facing TLS leg
//!
//! A session asks its [`CertificateProvider`] for a certificate/key pair whenever the caller of
//! `upgrade_to_tls` does not supply one. Two providers ship with the crate:
//!
//! - [`StaticCertificate`] serves one injected pair for every host
//! - [`DevelopmentAuthority`] creates a throwaway local CA and mints cached per-host leaves
//!
//! Clients only trust these certificates if the matching CA (or the static certificate) was
//! installed as a trust anchor beforehand; that provisioning step is outside this crate.

use crate::mitm::error::MitmError;
use crate::mitm::tls_config::TlsConfigError;
use async_trait::async_trait;
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// PEM-encoded certificate chain and private key
#[derive(Clone)]
pub struct CertKeyPair {
    cert: String,
    key: Arc<SecretString>,
}

impl CertKeyPair {
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: Arc::new(SecretString::new(key.into())),
        }
    }

    /// Read and validate a PEM pair from disk
    pub fn from_files(cert_path: &str, key_path: &str) -> anyhow::Result<Self> {
        let (cert, key) = crate::tls::load_pem_files(cert_path, key_path)?;
        Ok(Self::new(cert, key))
    }

    /// Self-signed pair for `localhost`, `127.0.0.1` and `::1`.
    ///
    /// This is the default intercepting identity for development and tests. Nothing outside
    /// a local machine should trust it.
    pub fn development() -> Result<Self, MitmError> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]);
        params
            .distinguished_name
            .push(DnType::CommonName, "mitm-session development");
        params.subject_alt_names.push(SanType::IpAddress(IpAddr::from([127, 0, 0, 1])));
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])));

        let cert = Certificate::from_params(params)
            .map_err(|e| MitmError::cert_generation("localhost", e.to_string()))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| MitmError::cert_generation("localhost", e.to_string()))?;

        Ok(Self::new(cert_pem, cert.serialize_private_key_pem()))
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert
    }

    pub fn key_pem(&self) -> &str {
        self.key.expose_secret()
    }

    /// Decode into the DER types rustls consumes
    pub fn to_rustls(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsConfigError> {
        crate::tls::parse_pem_identity(&self.cert, self.key.expose_secret())
    }
}

impl fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("cert_len", &self.cert.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Source of intercepting certificates, keyed by the host the client asked for
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn certificate_for(&self, host: &str) -> Result<CertKeyPair, MitmError>;
}

/// Serves the same pair for every host
#[derive(Debug, Clone)]
pub struct StaticCertificate {
    pair: CertKeyPair,
}

impl StaticCertificate {
    pub fn new(pair: CertKeyPair) -> Self {
        Self { pair }
    }
}

#[async_trait]
impl CertificateProvider for StaticCertificate {
    async fn certificate_for(&self, _host: &str) -> Result<CertKeyPair, MitmError> {
        Ok(self.pair.clone())
    }
}

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> Result<Self, MitmError> {
        let hostname = hostname.trim_start_matches('[').trim_end_matches(']');
        if hostname.is_empty() {
            return Err(MitmError::InvalidHost(hostname.to_string()));
        }

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        let hostname = hostname.to_ascii_lowercase();
        if hostname.starts_with("*.") {
            return Ok(Self::Wildcard(hostname));
        }

        Ok(Self::Domain(hostname))
    }

    fn common_name(&self) -> String {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => name.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }

    fn san(&self) -> SanType {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => SanType::DnsName(name.clone()),
            Self::IpAddress(ip) => SanType::IpAddress(*ip),
        }
    }
}

/// Throwaway local CA that signs a leaf certificate per intercepted host
pub struct DevelopmentAuthority {
    ca: Certificate,
    ca_pem: String,
    cache: Mutex<LruCache<HostIdentifier, CertKeyPair>>,
    max_cache_size: usize,
}

impl DevelopmentAuthority {
    /// Generate a fresh CA. Leaves are cached up to `max_cache_size` hosts.
    pub fn new(max_cache_size: usize) -> Result<Self, MitmError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "mitm-session development CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "mitm-session");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);

        let ca = Certificate::from_params(params)
            .map_err(|e| MitmError::cert_generation("development CA", e.to_string()))?;
        let ca_pem = ca
            .serialize_pem()
            .map_err(|e| MitmError::cert_generation("development CA", e.to_string()))?;

        let cache_size = NonZeroUsize::new(max_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            ca,
            ca_pem,
            cache: Mutex::new(LruCache::new(cache_size)),
            max_cache_size: cache_size.get(),
        })
    }

    /// PEM of the CA certificate clients must trust
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), self.max_cache_size)
    }

    /// Clear cache (for testing or rotation)
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    fn issue(&self, host: &HostIdentifier) -> Result<CertKeyPair, MitmError> {
        let name = host.common_name();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name.clone());
        params.subject_alt_names = vec![host.san()];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(generate_serial_number().into());

        let leaf = Certificate::from_params(params)
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;
        let cert_pem = leaf
            .serialize_pem_with_signer(&self.ca)
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;

        Ok(CertKeyPair::new(cert_pem, leaf.serialize_private_key_pem()))
    }
}

#[async_trait]
impl CertificateProvider for DevelopmentAuthority {
    async fn certificate_for(&self, host: &str) -> Result<CertKeyPair, MitmError> {
        let host = HostIdentifier::from_hostname(host)?;

        let mut cache = self.cache.lock().await;
        if let Some(pair) = cache.get(&host) {
            debug!(host = ?host, "Certificate cache hit");
            return Ok(pair.clone());
        }

        debug!(host = ?host, "Generating new certificate");
        let pair = self.issue(&host)?;
        cache.put(host, pair.clone());
        Ok(pair)
    }
}

/// Generate unique serial number using crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}
