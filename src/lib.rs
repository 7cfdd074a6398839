//! mitm-session - Per-connection sessions for a TLS-intercepting proxy
//!
//! A [`Session`] owns one client connection and its upstream connection. It forwards bytes
//! between them, splits a CONNECT tunnel into two independently terminated TLS connections so
//! the plaintext can be observed, and rebuilds structured HTTP messages from raw bytes without
//! touching the network.
//!
//! ## Features
//!
//! - **TLS Interception**: rustls on both legs, SNI propagated to the real destination
//! - **Message Reconstruction**: hyper's HTTP/1 parser driven over an in-memory transport
//! - **Certificate Providers**: static injected pair or a development CA with per-host leaves
//! - **Metrics**: Prometheus-compatible metrics
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mitm_session::{SessionFactory, TunnelTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = SessionFactory::from_env()?;
//!     let session = factory.create_with_generated_id();
//!
//!     session.set_tunnel_target(TunnelTarget::new("example.com", 443));
//!
//!     let request = session
//!         .reconstruct_request(&b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n"[..])
//!         .await;
//!     println!("{:?}", request.map(|r| r.uri().clone()));
//!
//!     session.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `session` - Session lifecycle, forwarding, upgrade and reconstruction
//! - `socket` - Driver tasks and handles for attached transports
//! - `mitm` - Certificates, TLS configuration, handshakes and the message mirror
//! - `config` - Environment-driven configuration
//! - `metrics` - Prometheus collectors

// Core session modules
pub mod config;
pub mod session;
pub mod socket;

// MITM interception
pub mod mitm;

// Metrics
pub mod metrics;

// TLS utilities
pub mod tls;

// Re-export commonly used types
pub use config::SessionConfig;
pub use metrics::SessionMetrics;
pub use mitm::{
    CertKeyPair, CertificateProvider, DevelopmentAuthority, MirrorError, MitmError,
    StaticCertificate, UpstreamTrust,
};
pub use session::{
    InterceptCallbacks, Session, SessionFactory, SessionState, TunnelStats, TunnelTarget,
    UpstreamTarget,
};
pub use socket::{CloseEvent, CloseReason, Side};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
