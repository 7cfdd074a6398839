//! MITM error types

use crate::socket::Side;
use thiserror::Error;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// Certificate generation failed
    #[error("Failed to generate certificate for {host}: {reason}")]
    CertGenerationFailed { host: String, reason: String },

    /// Certificate or key PEM could not be parsed
    #[error("Failed to parse certificate: {0}")]
    CertParseFailed(String),

    /// TLS handshake failed
    #[error("TLS handshake failed on {side} side for {host}: {reason}")]
    TlsHandshakeFailed {
        side: Side,
        host: String,
        reason: String,
    },

    /// TLS handshake did not finish in time
    #[error("TLS handshake timed out on {side} side after {timeout_ms}ms")]
    HandshakeTimeout { side: Side, timeout_ms: u64 },

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// No usable server name for the upstream handshake
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// A transport was missing or already gone when it was needed
    #[error("No live {0} transport")]
    TransportUnavailable(Side),
}

impl MitmError {
    /// Create a certificate generation error
    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(side: Side, host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            side,
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CertGenerationFailed { .. } => "cert_generation",
            Self::CertParseFailed(_) => "cert_parse",
            Self::TlsHandshakeFailed { .. } => "handshake",
            Self::HandshakeTimeout { .. } => "timeout",
            Self::TlsConfigFailed(_) => "config",
            Self::InvalidHost(_) => "invalid_host",
            Self::TransportUnavailable(_) => "transport_unavailable",
        }
    }
}
