use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::mitm::certificate_authority::{
    CertKeyPair, CertificateProvider, DevelopmentAuthority, StaticCertificate,
};
use crate::mitm::tls_config::{TlsConfigError, TlsVersion, UpstreamTlsConfig, UpstreamTrust};

/// Settings shared by every session a factory creates
#[derive(Debug, Clone)]
pub struct SessionConfig {
    // Message reconstruction bound (None waits forever)
    pub reconstruct_timeout: Option<Duration>,

    // TLS interception
    pub handshake_timeout: Duration,
    pub tls_version: TlsVersion,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub upstream_trust: UpstreamTrust,

    // Transport I/O
    pub read_buffer_size: usize,

    // Intercepting certificates
    pub cert_cache_size: usize,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconstruct_timeout: Some(Duration::from_millis(10_000)),
            handshake_timeout: Duration::from_millis(10_000),
            tls_version: TlsVersion::default(),
            alpn_protocols: vec![b"http/1.1".to_vec()],
            upstream_trust: UpstreamTrust::Verify,
            read_buffer_size: 16 * 1024,
            cert_cache_size: 1000,
            cert_path: None,
            key_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let reconstruct_timeout_ms: u64 = parse_var("SESSION_RECONSTRUCT_TIMEOUT_MS", 10_000)?;
        let handshake_timeout_ms: u64 = parse_var("SESSION_HANDSHAKE_TIMEOUT_MS", 10_000)?;
        let read_buffer_size = parse_var("SESSION_READ_BUFFER_SIZE", 16 * 1024)?;
        let cert_cache_size = parse_var("SESSION_CERT_CACHE_SIZE", 1000)?;

        let tls_version_raw = env::var("SESSION_TLS_VERSION").unwrap_or_else(|_| "1.2+".to_string());
        let tls_version = TlsVersion::parse(&tls_version_raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid SESSION_TLS_VERSION '{}' (expected 1.2+ or 1.3)",
                tls_version_raw
            )
        })?;

        let alpn_protocols = parse_alpn(
            &env::var("SESSION_ALPN").unwrap_or_else(|_| "http/1.1".to_string()),
        );

        let cert_path = env::var("SESSION_TLS_CERT_PATH").ok().filter(|p| !p.is_empty());
        let key_path = env::var("SESSION_TLS_KEY_PATH").ok().filter(|p| !p.is_empty());

        let upstream_trust = upstream_trust_from_env()?;

        let config = SessionConfig {
            reconstruct_timeout: (reconstruct_timeout_ms > 0)
                .then(|| Duration::from_millis(reconstruct_timeout_ms)),
            handshake_timeout: Duration::from_millis(handshake_timeout_ms),
            tls_version,
            alpn_protocols,
            upstream_trust,
            read_buffer_size,
            cert_cache_size,
            cert_path,
            key_path,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(anyhow::anyhow!("SESSION_READ_BUFFER_SIZE must be greater than 0"));
        }
        if self.cert_cache_size == 0 {
            return Err(anyhow::anyhow!("SESSION_CERT_CACHE_SIZE must be greater than 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow::anyhow!("SESSION_HANDSHAKE_TIMEOUT_MS must be greater than 0"));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(anyhow::anyhow!(
                "SESSION_TLS_CERT_PATH and SESSION_TLS_KEY_PATH must be set together"
            ));
        }
        Ok(())
    }

    /// Provider used when `upgrade_to_tls` gets no explicit pair: the configured PEM files, or a
    /// freshly generated development CA.
    pub fn certificate_provider(&self) -> Result<Arc<dyn CertificateProvider>> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let pair = CertKeyPair::from_files(cert_path, key_path)
                    .context("Failed to load intercepting certificate")?;
                Ok(Arc::new(StaticCertificate::new(pair)))
            }
            _ => {
                let authority = DevelopmentAuthority::new(self.cert_cache_size)
                    .context("Failed to create development certificate authority")?;
                Ok(Arc::new(authority))
            }
        }
    }

    pub fn upstream_tls_config(&self) -> std::result::Result<UpstreamTlsConfig, TlsConfigError> {
        UpstreamTlsConfig::new_with_options(
            self.tls_version,
            self.upstream_trust,
            self.alpn_protocols.clone(),
        )
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn parse_alpn(raw: &str) -> Vec<Vec<u8>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.as_bytes().to_vec())
        .collect()
}

// DISABLE_UPSTREAM_TLS_VERIFY_NONPROD for testing/development only.
// Requires the explicit _NONPROD suffix and is refused when the environment names production.
fn upstream_trust_from_env() -> Result<UpstreamTrust> {
    if env::var("DISABLE_UPSTREAM_TLS_VERIFY_NONPROD").is_err() {
        return Ok(UpstreamTrust::Verify);
    }

    let environment = env::var("ENVIRONMENT")
        .or_else(|_| env::var("ENV"))
        .unwrap_or_else(|_| "unknown".to_string())
        .to_lowercase();

    if environment.contains("prod") {
        return Err(anyhow::anyhow!(
            "DISABLE_UPSTREAM_TLS_VERIFY_NONPROD is set but ENVIRONMENT={}. \
             Upstream TLS verification cannot be disabled in production.",
            environment
        ));
    }

    error!(environment = %environment, "Upstream TLS certificate verification disabled by DISABLE_UPSTREAM_TLS_VERIFY_NONPROD");
    Ok(UpstreamTrust::AcceptAny)
}
