//! TLS Interceptor - terminate both legs of an intercepted tunnel
//!
//! The interceptor upgrades raw transports in place:
//! 1. Toward the client it acts as a TLS server presenting the intercepting certificate
//! 2. Toward the upstream it acts as a TLS client with SNI set to the real destination
//!
//! Both handshakes are bounded by the configured handshake timeout. Failures come back as
//! [`MitmError`] values; the session turns them into close events.

use crate::config::SessionConfig;
use crate::metrics::SessionMetrics;
use crate::mitm::certificate_authority::{CertKeyPair, CertificateProvider};
use crate::mitm::error::MitmError;
use crate::mitm::tls_config::{role_label, ClientTlsConfig, SniUtils, TlsVersion};
use crate::socket::{BoxedTransport, Side};
use rustls::ClientConfig;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Shared TLS machinery for every session created by one factory
pub struct TlsInterceptor {
    provider: Arc<dyn CertificateProvider>,
    upstream_config: Arc<ClientConfig>,
    tls_version: TlsVersion,
    alpn_protocols: Vec<Vec<u8>>,
    handshake_timeout: Duration,
}

impl TlsInterceptor {
    pub fn new(
        config: &SessionConfig,
        provider: Arc<dyn CertificateProvider>,
    ) -> Result<Self, MitmError> {
        let upstream = config
            .upstream_tls_config()
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;

        Ok(Self {
            provider,
            upstream_config: upstream.client_config(),
            tls_version: config.tls_version,
            alpn_protocols: config.alpn_protocols.clone(),
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Terminate the client's TLS with `pair`, or with a certificate from the provider for `host`
    pub async fn accept_client(
        &self,
        io: BoxedTransport,
        host: &str,
        pair: Option<CertKeyPair>,
    ) -> Result<BoxedTransport, MitmError> {
        let pair = match pair {
            Some(pair) => pair,
            None => self.provider.certificate_for(host).await?,
        };

        let (chain, key) = pair
            .to_rustls()
            .map_err(|e| MitmError::CertParseFailed(e.to_string()))?;
        let server_config = ClientTlsConfig::new_with_options(
            chain,
            key,
            self.tls_version,
            self.alpn_protocols.clone(),
        )
        .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;

        let acceptor = TlsAcceptor::from(server_config.server_config());
        let stream = self
            .bounded(Side::Client, host, acceptor.accept(io))
            .await?;

        Ok(Box::new(stream))
    }

    /// Open TLS toward the real destination with SNI `server_name`
    pub async fn connect_upstream(
        &self,
        io: BoxedTransport,
        server_name: &str,
    ) -> Result<BoxedTransport, MitmError> {
        let name = SniUtils::parse_server_name(server_name)
            .map_err(|_| MitmError::InvalidHost(server_name.to_string()))?;

        let connector = TlsConnector::from(Arc::clone(&self.upstream_config));
        let stream = self
            .bounded(Side::Upstream, server_name, connector.connect(name, io))
            .await?;

        Ok(Box::new(stream))
    }

    async fn bounded<S, F>(&self, side: Side, host: &str, handshake: F) -> Result<S, MitmError>
    where
        F: Future<Output = io::Result<S>>,
    {
        let side_label = side.to_string();
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.handshake_timeout, handshake).await;
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(stream)) => {
                SessionMetrics::record_handshake(&side_label, true, elapsed);
                debug!(
                    side = %side,
                    role = role_label(side),
                    host = %host,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "TLS handshake complete"
                );
                Ok(stream)
            }
            Ok(Err(e)) => {
                SessionMetrics::record_handshake(&side_label, false, elapsed);
                SessionMetrics::record_handshake_error(&side_label, "handshake");
                warn!(side = %side, host = %host, error = %e, "TLS handshake failed");
                Err(MitmError::tls_handshake(side, host, e.to_string()))
            }
            Err(_) => {
                SessionMetrics::record_handshake(&side_label, false, elapsed);
                SessionMetrics::record_handshake_error(&side_label, "timeout");
                warn!(
                    side = %side,
                    host = %host,
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "TLS handshake timed out"
                );
                Err(MitmError::HandshakeTimeout {
                    side,
                    timeout_ms: self.handshake_timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::certificate_authority::StaticCertificate;
    use crate::mitm::tls_config::UpstreamTrust;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn interceptor(timeout: Duration) -> TlsInterceptor {
        let config = SessionConfig {
            handshake_timeout: timeout,
            upstream_trust: UpstreamTrust::AcceptAny,
            ..SessionConfig::default()
        };
        let provider = Arc::new(StaticCertificate::new(CertKeyPair::development().unwrap()));
        TlsInterceptor::new(&config, provider).unwrap()
    }

    #[tokio::test]
    async fn test_client_and_upstream_legs_handshake() {
        let interceptor = Arc::new(interceptor(Duration::from_secs(5)));
        let (a, b) = duplex(16 * 1024);

        let server_side = Arc::clone(&interceptor);
        let server = tokio::spawn(async move {
            let mut tls = server_side
                .accept_client(Box::new(a), "localhost", None)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = interceptor
            .connect_upstream(Box::new(b), "localhost")
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let interceptor = interceptor(Duration::from_millis(100));
        let (a, _silent_peer) = duplex(1024);

        let err = interceptor
            .accept_client(Box::new(a), "localhost", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MitmError::HandshakeTimeout {
                side: Side::Client,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_from_client_fails_handshake() {
        let interceptor = interceptor(Duration::from_secs(5));
        let (a, mut peer) = duplex(1024);
        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = interceptor
            .accept_client(Box::new(a), "localhost", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MitmError::TlsHandshakeFailed { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let interceptor = interceptor(Duration::from_secs(1));
        let (a, _b) = duplex(1024);
        let err = interceptor
            .connect_upstream(Box::new(a), "not a hostname!")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MitmError::InvalidHost(_)));
    }
}
