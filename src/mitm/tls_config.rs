//! TLS Configuration - rustls settings for both interception legs
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) with the intercepting certificate
//! - Upstream TLS (proxy → upstream) with a selectable trust policy
//!
//! All configs are built on the `ring` crypto provider so no process-wide default
//! provider has to be installed.

use crate::socket::Side;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    /// Parse the `SESSION_TLS_VERSION` notation (`1.2+` or `1.3`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1.2+" | "1.2" | "tls12" => Some(Self::Tls12And13),
            "1.3" | "tls13" => Some(Self::Tls13Only),
            _ => None,
        }
    }

    fn versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            Self::Tls12And13 => vec![&TLS12, &TLS13],
            Self::Tls13Only => vec![&TLS13],
        }
    }
}

/// How the upstream leg treats the destination's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamTrust {
    /// Verify against the Mozilla root set (webpki-roots) and the SNI hostname
    #[default]
    Verify,
    /// Accept any upstream certificate.
    ///
    /// This is what a classic intercepting proxy does, and it means the proxy itself can be
    /// fooled by an attacker sitting between it and the destination. Only select it for
    /// development or when a stricter policy is enforced elsewhere.
    AcceptAny,
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Client-facing TLS config (proxy acts as server with the intercepting cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config with the intercepting certificate
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        Self::new_with_options(
            cert_chain,
            private_key,
            TlsVersion::default(),
            vec![b"http/1.1".to_vec()],
        )
    }

    /// Build server config with specific TLS version and ALPN list
    pub fn new_with_options(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        tls_version: TlsVersion,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        // The real client is never asked for a certificate.
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&tls_version.versions())
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

        config.alpn_protocols = alpn_protocols;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client toward the real destination)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
    trust: UpstreamTrust,
}

impl UpstreamTlsConfig {
    /// Build client config that verifies upstream certificates
    pub fn new() -> Result<Self, TlsConfigError> {
        Self::new_with_options(TlsVersion::default(), UpstreamTrust::Verify, Vec::new())
    }

    /// Build client config with specific TLS version, trust policy and ALPN list
    pub fn new_with_options(
        tls_version: TlsVersion,
        trust: UpstreamTrust,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&tls_version.versions())
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        let mut config = match trust {
            UpstreamTrust::Verify => {
                let mut root_store = RootCertStore::empty();
                root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            UpstreamTrust::AcceptAny => {
                error!("Upstream TLS certificate verification is DISABLED for intercepted sessions");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
                    .with_no_client_auth()
            }
        };

        config.alpn_protocols = alpn_protocols;

        info!(
            tls_version = ?tls_version,
            trust = ?trust,
            "Upstream TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
            trust,
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn trust(&self) -> UpstreamTrust {
        self.trust
    }
}

/// Certificate verifier for `UpstreamTrust::AcceptAny`.
///
/// Chain and hostname checks are skipped. Handshake signatures are still verified so the
/// session keys stay bound to the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }

    /// Pick the SNI value for the upstream handshake.
    ///
    /// Preference order: the tunnel's upstream host, the host the upstream transport was
    /// opened for, then the tunnel address. Empty or malformed candidates are skipped.
    pub fn select<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<&'a str> {
        candidates
            .into_iter()
            .flatten()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .find(|host| Self::validate_hostname(host))
    }
}

/// Label used in logs for each leg's TLS role
pub fn role_label(side: Side) -> &'static str {
    match side {
        Side::Client => "server-for-client",
        Side::Upstream => "client-for-upstream",
    }
}
