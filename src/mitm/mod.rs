//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides the TLS interception and message inspection pieces used by
//! [`Session`](crate::session::Session):
//! - Certificate providers for the client-facing leg (static pair or development CA)
//! - rustls configuration for both legs, with SNI selection
//! - TLS handshake handling (client and upstream) with timeouts
//! - HTTP/1 message reconstruction from captured bytes

pub mod certificate_authority;
pub mod error;
pub mod interceptor;
pub mod mirror;
pub mod tls_config;

// Re-export main types
pub use certificate_authority::{
    CertKeyPair, CertificateProvider, DevelopmentAuthority, HostIdentifier, StaticCertificate,
};
pub use error::MitmError;
pub use interceptor::TlsInterceptor;
pub use mirror::{
    parse_request, parse_response, Completion, MessageMirror, MirrorError, MirrorRole,
    MirrorStream, ReconstructedRequest, ReconstructedResponse, Resolver,
};
pub use tls_config::{
    ClientTlsConfig, SniUtils, TlsConfigError, TlsVersion, UpstreamTlsConfig, UpstreamTrust,
};
