//! Session Integration Tests
//!
//! Tests for session lifecycle, forwarding, tunnel metadata, message reconstruction and
//! TLS interception over in-memory pipes

use bytes::Bytes;
use mitm_session::mitm::{ClientTlsConfig, MirrorError};
use mitm_session::{
    CertKeyPair, CloseEvent, CloseReason, InterceptCallbacks, Session, SessionConfig,
    SessionFactory, SessionState, Side, StaticCertificate, TunnelTarget, UpstreamTrust,
};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> SessionConfig {
    SessionConfig {
        reconstruct_timeout: Some(Duration::from_millis(300)),
        handshake_timeout: Duration::from_secs(5),
        upstream_trust: UpstreamTrust::AcceptAny,
        ..SessionConfig::default()
    }
}

fn factory_with(pair: CertKeyPair) -> SessionFactory {
    SessionFactory::new(test_config(), Arc::new(StaticCertificate::new(pair))).unwrap()
}

fn factory() -> SessionFactory {
    factory_with(CertKeyPair::development().unwrap())
}

// ============================================================================
// Lifecycle & forwarding
// ============================================================================

#[tokio::test]
async fn test_destroy_twice_never_fails() {
    let session = factory().create("lifecycle");
    session.destroy();
    session.destroy();
    assert_eq!(session.state(), SessionState::Closed);

    let session = factory().create("lifecycle-with-transports");
    let (client, _client_peer) = duplex(64);
    let (upstream, _upstream_peer) = duplex(64);
    session
        .attach_client_transport(client)
        .attach_upstream_transport(upstream);
    session.destroy().destroy();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_writes_forwarded_in_order() {
    let session = factory().create("forward");
    let (client, mut client_peer) = duplex(1024);
    let (upstream, mut upstream_peer) = duplex(1024);
    session
        .attach_client_transport(client)
        .attach_upstream_transport(upstream);

    session
        .write_to_upstream(Bytes::from_static(b"CONNECT "))
        .write_to_upstream(Bytes::new())
        .write_to_upstream(Bytes::from_static(b"a:443"));
    session.write_to_client(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));

    let mut buf = vec![0u8; 13];
    upstream_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"CONNECT a:443");

    let mut buf = vec![0u8; 19];
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n\r\n");
}

#[tokio::test]
async fn test_writes_without_transport_are_noops() {
    let session = factory().create("no-transport");
    session
        .write_to_client(Bytes::from_static(b"lost"))
        .write_to_upstream(Bytes::from_static(b"lost"));
    assert_eq!(session.state(), SessionState::Plain);
}

#[tokio::test]
async fn test_writes_after_destroy_have_no_effect() {
    let session = factory().create("after-destroy");
    let (client, mut client_peer) = duplex(64);
    session.attach_client_transport(client);

    session.destroy();
    session.write_to_client(Bytes::from_static(b"too late"));

    let mut buf = Vec::new();
    let n = tokio::time::timeout(WAIT, client_peer.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(buf.is_empty());
}

// ============================================================================
// Authentication & tunnel metadata
// ============================================================================

#[tokio::test]
async fn test_authenticate() {
    let session = factory().create("auth");
    session.authenticate(Some(""));
    assert!(!session.is_authenticated());
    session.authenticate(None);
    assert!(!session.is_authenticated());

    session.authenticate(Some("bob"));
    assert!(session.is_authenticated());
    assert_eq!(session.user().as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_tunnel_stats_with_upstream() {
    let session = factory().create("tunnel");
    session.set_tunnel_target(TunnelTarget::new("a", 443).with_upstream("b", 8443));

    let json = serde_json::to_value(session.tunnel_stats()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "ADDRESS": "a",
            "PORT": 443,
            "UPSTREAM": {"host": "b", "port": 8443}
        })
    );
}

#[tokio::test]
async fn test_tunnel_stats_without_upstream() {
    let session = factory().create("tunnel");
    session.set_tunnel_target(TunnelTarget::new("a", 443));

    let json = serde_json::to_value(session.tunnel_stats()).unwrap();
    assert_eq!(json, serde_json::json!({"ADDRESS": "a", "PORT": 443}));
    assert!(json.get("UPSTREAM").is_none());
}

// ============================================================================
// Message reconstruction
// ============================================================================

fn attached(id: &str) -> (Session, DuplexStream, DuplexStream) {
    let session = factory().create(id);
    let (client, client_peer) = duplex(64);
    let (upstream, upstream_peer) = duplex(64);
    session
        .attach_client_transport(client)
        .attach_upstream_transport(upstream);
    (session, client_peer, upstream_peer)
}

#[tokio::test]
async fn test_reconstruct_request() {
    let (session, _c, _u) = attached("reconstruct");
    let req = session
        .reconstruct_request(&b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"[..])
        .await
        .unwrap();
    assert_eq!(req.method(), http::Method::GET);
    assert_eq!(req.uri().path(), "/x");
    assert_eq!(req.headers()["host"], "h");
    assert!(req.body().is_empty());
}

#[tokio::test]
async fn test_reconstruct_response() {
    let (session, _c, _u) = attached("reconstruct");
    let res = session
        .reconstruct_response(
            &b"HTTP/1.1 302 Found\r\nLocation: /next\r\nSet-Cookie: a=1\r\nContent-Length: 0\r\n\r\n"[..],
        )
        .await
        .unwrap();
    assert_eq!(res.status(), http::StatusCode::FOUND);
    assert_eq!(res.headers()["location"], "/next");
    assert_eq!(res.headers()["set-cookie"], "a=1");
}

#[tokio::test]
async fn test_reconstruct_connect_request() {
    let (session, _c, _u) = attached("reconstruct");
    let req = session
        .reconstruct_request(&b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"[..])
        .await
        .unwrap();
    assert_eq!(req.method(), http::Method::CONNECT);
    assert_eq!(req.uri().host(), Some("example.com"));
    assert_eq!(req.uri().port_u16(), Some(443));
}

#[tokio::test]
async fn test_reconstruct_close_delimited_response() {
    let (session, _c, _u) = attached("reconstruct");
    let res = session
        .reconstruct_response(&b"HTTP/1.0 403 Forbidden\r\nContent-Type: text/html\r\n\r\n<h1>no</h1>"[..])
        .await
        .unwrap();
    assert_eq!(res.status(), http::StatusCode::FORBIDDEN);
    assert_eq!(res.headers()["content-type"], "text/html");
    assert_eq!(res.body().as_ref(), b"<h1>no</h1>");
}

#[tokio::test]
async fn test_reconstruct_chunked_response() {
    let (session, _c, _u) = attached("reconstruct");
    let res = session
        .reconstruct_response(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"[..],
        )
        .await
        .unwrap();
    assert_eq!(res.body().as_ref(), b"hello world");
}

#[tokio::test]
async fn test_reconstruct_head_response() {
    let (session, _c, _u) = attached("reconstruct");
    let res = session
        .reconstruct_response_to(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 512\r\n\r\n"[..],
            http::Method::HEAD,
        )
        .await
        .unwrap();
    assert!(res.body().is_empty());
}

#[tokio::test]
async fn test_reconstruct_incomplete_times_out() {
    let (session, _c, _u) = attached("reconstruct");
    let err = session
        .reconstruct_request(&b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\nabc"[..])
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Incomplete(_)));
}

#[tokio::test]
async fn test_concurrent_reconstruction_is_busy() {
    let (session, _c, _u) = attached("reconstruct");

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .reconstruct_request(&b"GET / HTTP/1.1\r\nHost: h"[..])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = session
        .reconstruct_request(&b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"[..])
        .await;
    assert!(matches!(second, Err(MirrorError::Busy("request"))));

    // The other direction is independent
    let response = session
        .reconstruct_response(&b"HTTP/1.1 204 No Content\r\n\r\n"[..])
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    assert!(matches!(
        first.await.unwrap(),
        Err(MirrorError::Incomplete(_))
    ));

    // Slot released after the first one finished
    assert!(session
        .reconstruct_request(&b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"[..])
        .await
        .is_ok());
}

// ============================================================================
// TLS interception
// ============================================================================

struct Harness {
    session: Session,
    client_app: DuplexStream,
    upstream_app: DuplexStream,
    client_trust: RootCertStore,
    upstream_acceptor: TlsAcceptor,
    closes: mpsc::UnboundedReceiver<CloseEvent>,
    callbacks: InterceptCallbacks,
}

fn harness(tunnel: TunnelTarget) -> Harness {
    let pair = CertKeyPair::development().unwrap();
    let (chain, _) = pair.to_rustls().unwrap();
    let mut client_trust = RootCertStore::empty();
    client_trust.add(chain[0].clone()).unwrap();

    let session = factory_with(pair).create("tls");
    let (client_proxy, client_app) = duplex(16 * 1024);
    let (upstream_proxy, upstream_app) = duplex(16 * 1024);
    session
        .attach_client_transport(client_proxy)
        .attach_upstream_transport(upstream_proxy)
        .set_tunnel_target(tunnel);

    // Real destination with its own self-signed certificate
    let destination = rcgen::generate_simple_self_signed(vec!["real.example".to_string()]).unwrap();
    let destination = CertKeyPair::new(
        destination.serialize_pem().unwrap(),
        destination.serialize_private_key_pem(),
    );
    let (chain, key) = destination.to_rustls().unwrap();
    let upstream_acceptor =
        TlsAcceptor::from(ClientTlsConfig::new(chain, key).unwrap().server_config());

    let (close_tx, closes) = mpsc::unbounded_channel();
    let to_upstream = session.clone();
    let to_client = session.clone();
    let callbacks = InterceptCallbacks::new(
        move |data| {
            to_upstream.write_to_upstream(data);
        },
        move |data| {
            to_client.write_to_client(data);
        },
        move |event| {
            let _ = close_tx.send(event);
        },
    );

    Harness {
        session,
        client_app,
        upstream_app,
        client_trust,
        upstream_acceptor,
        closes,
        callbacks,
    }
}

fn client_connector(roots: RootCertStore) -> TlsConnector {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_intercepted_round_trip_with_sni() {
    let h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    let session = h.session.clone();

    session.upgrade_to_tls(h.callbacks.clone(), None);
    assert_eq!(session.state(), SessionState::Upgrading);
    assert!(session.is_https());
    assert_eq!(session.server_name().as_deref(), Some("real.example"));

    let acceptor = h.upstream_acceptor.clone();
    let upstream_app = h.upstream_app;
    let destination = tokio::spawn(async move {
        let mut tls = acceptor.accept(upstream_app).await.unwrap();
        let sni = tls.get_ref().1.server_name().map(str::to_string);

        let mut buf = vec![0u8; 37];
        tls.read_exact(&mut buf).await.unwrap();
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        tls.flush().await.unwrap();
        (sni, buf, tls)
    });

    let mut client = tokio::time::timeout(
        WAIT,
        client_connector(h.client_trust)
            .connect(ServerName::try_from("localhost").unwrap(), h.client_app),
    )
    .await
    .unwrap()
    .unwrap();

    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: real.example\r\n")
        .await
        .unwrap();
    client.flush().await.unwrap();

    let (sni, seen, _destination_tls) = tokio::time::timeout(WAIT, destination)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sni.as_deref(), Some("real.example"));
    assert_eq!(&seen, b"GET /x HTTP/1.1\r\nHost: real.example\r\n");

    let mut reply = vec![0u8; 40];
    tokio::time::timeout(WAIT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    assert_eq!(session.state(), SessionState::Active);

    // Plaintext seen by the proxy can be rebuilt
    let res = session.reconstruct_response(reply).await.unwrap();
    assert_eq!(res.body().as_ref(), b"ok");
}

#[tokio::test]
async fn test_double_upgrade_performs_one_handshake() {
    let h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    let session = h.session.clone();

    session
        .upgrade_to_tls(h.callbacks.clone(), None)
        .upgrade_to_tls(h.callbacks.clone(), None);

    let acceptor = h.upstream_acceptor.clone();
    let upstream_app = h.upstream_app;
    let destination = tokio::spawn(async move {
        let mut tls = acceptor.accept(upstream_app).await.unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.unwrap();
        (buf, tls)
    });

    let mut client = client_connector(h.client_trust)
        .connect(ServerName::try_from("localhost").unwrap(), h.client_app)
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();

    let (seen, _destination_tls) = tokio::time::timeout(WAIT, destination)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&seen, b"hello");

    // A late third call changes nothing either
    session.upgrade_to_tls(h.callbacks.clone(), None);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_writes_during_handshake_are_delivered() {
    let h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    let session = h.session.clone();

    session.upgrade_to_tls(h.callbacks.clone(), None);
    session.write_to_client(Bytes::from_static(b"early"));

    let acceptor = h.upstream_acceptor.clone();
    let upstream_app = h.upstream_app;
    let _destination = tokio::spawn(async move { acceptor.accept(upstream_app).await });

    let mut client = client_connector(h.client_trust)
        .connect(ServerName::try_from("localhost").unwrap(), h.client_app)
        .await
        .unwrap();

    let mut buf = [0u8; 5];
    tokio::time::timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"early");
}

#[tokio::test]
async fn test_tunnel_target_frozen_after_upgrade() {
    let h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    h.session.upgrade_to_tls(h.callbacks.clone(), None);
    h.session
        .set_tunnel_target(TunnelTarget::new("other", 80).with_upstream("evil.example", 80));

    let stats = h.session.tunnel_stats();
    assert_eq!(stats.address.as_deref(), Some("localhost"));
    assert_eq!(stats.upstream.unwrap().host, "real.example");
    h.session.destroy();
}

#[tokio::test]
async fn test_sni_falls_back_to_host_hint_then_address() {
    let session = factory().create("sni");
    let (client, _c) = duplex(64);
    let (upstream, _u) = duplex(64);
    session
        .attach_client_transport(client)
        .attach_upstream_transport_with_host(upstream, "hint.example")
        .set_tunnel_target(TunnelTarget::new("proxy.local", 443));
    session.upgrade_to_tls(InterceptCallbacks::new(|_| {}, |_| {}, |_| {}), None);
    assert_eq!(session.server_name().as_deref(), Some("hint.example"));
    session.destroy();

    let session = factory().create("sni");
    let (client, _c) = duplex(64);
    let (upstream, _u) = duplex(64);
    session
        .attach_client_transport(client)
        .attach_upstream_transport(upstream)
        .set_tunnel_target(TunnelTarget::new("proxy.local", 443));
    session.upgrade_to_tls(InterceptCallbacks::new(|_| {}, |_| {}, |_| {}), None);
    assert_eq!(session.server_name().as_deref(), Some("proxy.local"));
    session.destroy();
}

#[tokio::test]
async fn test_upstream_handshake_failure_reaches_on_close() {
    let mut h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    h.session.upgrade_to_tls(h.callbacks.clone(), None);

    // Destination answers the ClientHello with garbage
    let mut upstream_app = h.upstream_app;
    let mut hello = [0u8; 5];
    upstream_app.read_exact(&mut hello).await.unwrap();
    upstream_app
        .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, h.closes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.side, Side::Upstream);
    assert!(event.is_error());
    assert_eq!(h.session.state(), SessionState::Closed);

    h.session.destroy();
}

#[tokio::test]
async fn test_destroy_after_upgrade_reports_destroyed() {
    let mut h = harness(TunnelTarget::new("localhost", 443).with_upstream("real.example", 443));
    h.session.upgrade_to_tls(h.callbacks.clone(), None);
    h.session.destroy();

    let mut sides = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(WAIT, h.closes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, CloseReason::Destroyed);
        sides.push(event.side);
    }
    sides.sort_by_key(|side| *side == Side::Upstream);
    assert_eq!(sides, vec![Side::Client, Side::Upstream]);

    // Second destroy is silent
    h.session.destroy();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), h.closes.recv())
            .await
            .is_err()
    );
    drop(h.client_app);
}
