//! Session - one intercepted client/upstream connection pair
//!
//! A [`Session`] owns the client-facing and upstream-facing transports of a single proxied
//! connection. It forwards bytes between them, records CONNECT tunnel metadata and
//! authentication, upgrades both legs to TLS in place, and rebuilds HTTP messages from raw
//! bytes through the message mirror.
//!
//! Lifecycle: `Plain -> Upgrading -> Active`, with `Closed` reachable from any state through
//! [`Session::destroy`] or a transport close event. Every operation on a closed session is a
//! harmless no-op.

use crate::config::SessionConfig;
use crate::metrics::SessionMetrics;
use crate::mitm::certificate_authority::{CertKeyPair, CertificateProvider};
use crate::mitm::error::MitmError;
use crate::mitm::interceptor::TlsInterceptor;
use crate::mitm::mirror::{self, MirrorError, ReconstructedRequest, ReconstructedResponse};
use crate::mitm::tls_config::SniUtils;
use crate::socket::{
    BoxedTransport, CloseCallback, CloseEvent, CloseReason, DataCallback, Side, SocketEvents,
    SocketHandle, Transport,
};
use anyhow::Context;
use bytes::Bytes;
use http::Method;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Transports carry plaintext (or an opaque tunnel)
    Plain = 0,
    /// TLS handshakes are in progress on both legs
    Upgrading = 1,
    /// Both legs are TLS-terminated by the session
    Active = 2,
    /// Destroyed, or a transport closed
    Closed = 3,
}

impl SessionState {
    /// Why the tunnel target can no longer change in this state
    fn tunnel_change_refusal(self) -> Option<&'static str> {
        match self {
            SessionState::Plain => None,
            SessionState::Upgrading | SessionState::Active => {
                Some("Tunnel target change after upgrade began, ignored")
            }
            SessionState::Closed => Some("Tunnel target change on a closed session, ignored"),
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Plain,
            1 => Self::Upgrading,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::Upgrading => "upgrading",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Real destination behind a CONNECT tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

/// CONNECT tunnel metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub address: String,
    pub port: u16,
    pub upstream: Option<UpstreamTarget>,
}

impl TunnelTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, host: impl Into<String>, port: u16) -> Self {
        self.upstream = Some(UpstreamTarget {
            host: host.into(),
            port,
        });
        self
    }
}

/// Snapshot of tunnel metadata. Serializes as `{"ADDRESS", "PORT", "UPSTREAM"}`, leaving out
/// whatever was never set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    #[serde(rename = "ADDRESS", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "PORT", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "UPSTREAM", skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamTarget>,
}

/// Listeners wired into the TLS-wrapped transports by [`Session::upgrade_to_tls`]
#[derive(Clone)]
pub struct InterceptCallbacks {
    /// Decrypted bytes sent by the client
    pub on_client_data: DataCallback,
    /// Decrypted bytes sent by the upstream
    pub on_upstream_data: DataCallback,
    /// Close, destroy, handshake failure or I/O error on either leg
    pub on_close: CloseCallback,
}

impl InterceptCallbacks {
    pub fn new(
        on_client_data: impl Fn(Bytes) + Send + Sync + 'static,
        on_upstream_data: impl Fn(Bytes) + Send + Sync + 'static,
        on_close: impl Fn(CloseEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_client_data: Arc::new(on_client_data),
            on_upstream_data: Arc::new(on_upstream_data),
            on_close: Arc::new(on_close),
        }
    }
}

#[derive(Default)]
struct Slots {
    client: Option<SocketHandle>,
    upstream: Option<SocketHandle>,
    upstream_host_hint: Option<String>,
    tunnel: Option<TunnelTarget>,
    user: Option<String>,
    server_name: Option<String>,
}

struct Inner {
    id: String,
    interceptor: Arc<TlsInterceptor>,
    read_buffer_size: usize,
    reconstruct_timeout: Option<Duration>,
    state: AtomicU8,
    destroyed: AtomicBool,
    authenticated: AtomicBool,
    https: AtomicBool,
    request_in_flight: AtomicBool,
    response_in_flight: AtomicBool,
    slots: Mutex<Slots>,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to Closed and fail pending reconstructions. Returns the previous state.
    fn mark_closed(&self) -> SessionState {
        let previous = SessionState::from_u8(
            self.state.swap(SessionState::Closed as u8, Ordering::SeqCst),
        );
        self.closed.send_replace(true);
        previous
    }
}

/// Releases a reconstruction slot when the reconstruction ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    fn label(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }

    // Requests come from the client leg, responses from the upstream leg.
    fn side(self) -> Side {
        match self {
            Self::Request => Side::Client,
            Self::Response => Side::Upstream,
        }
    }
}

/// Cloneable handle to one intercepted connection pair
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl Session {
    /// New session in the `Plain`, unauthenticated state
    pub fn new(id: impl Into<String>, config: &SessionConfig, interceptor: Arc<TlsInterceptor>) -> Self {
        let id = id.into();
        let (closed, _) = watch::channel(false);

        SessionMetrics::record_session_created();
        debug!(session_id = %id, "Session created");

        Self {
            inner: Arc::new(Inner {
                id,
                interceptor,
                read_buffer_size: config.read_buffer_size,
                reconstruct_timeout: config.reconstruct_timeout,
                state: AtomicU8::new(SessionState::Plain as u8),
                destroyed: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                https: AtomicBool::new(false),
                request_in_flight: AtomicBool::new(false),
                response_in_flight: AtomicBool::new(false),
                slots: Mutex::new(Slots::default()),
                closed,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    // ==================== Transports ====================

    /// Install the client-facing transport. Replaces (and destroys) any previous one.
    pub fn attach_client_transport<T: Transport>(&self, io: T) -> &Self {
        self.attach(Side::Client, io, None)
    }

    /// Install the upstream-facing transport. Replaces (and destroys) any previous one.
    pub fn attach_upstream_transport<T: Transport>(&self, io: T) -> &Self {
        self.attach(Side::Upstream, io, None)
    }

    /// Install the upstream transport and remember the host it was opened for, used as the
    /// SNI fallback when the tunnel names no upstream host.
    pub fn attach_upstream_transport_with_host<T: Transport>(
        &self,
        io: T,
        host: impl Into<String>,
    ) -> &Self {
        self.attach(Side::Upstream, io, Some(host.into()))
    }

    fn attach<T: Transport>(&self, side: Side, io: T, host_hint: Option<String>) -> &Self {
        if self.state() == SessionState::Closed {
            debug!(session_id = %self.inner.id, side = %side, "Attach on closed session ignored");
            return self;
        }

        let handle = SocketHandle::spawn(side, io, self.inner.read_buffer_size);
        let previous = {
            let mut slots = self.inner.slots();
            match side {
                Side::Client => slots.client.replace(handle),
                Side::Upstream => {
                    if host_hint.is_some() {
                        slots.upstream_host_hint = host_hint;
                    }
                    slots.upstream.replace(handle)
                }
            }
        };

        if let Some(previous) = previous {
            previous.destroy();
            debug!(session_id = %self.inner.id, side = %side, "Replaced attached transport");
        }
        self
    }

    fn handle(&self, side: Side) -> Option<SocketHandle> {
        let slots = self.inner.slots();
        match side {
            Side::Client => slots.client.clone(),
            Side::Upstream => slots.upstream.clone(),
        }
    }

    /// Queue bytes for the client. No-op when there is no live client transport or `data` is
    /// empty.
    pub fn write_to_client(&self, data: impl Into<Bytes>) -> &Self {
        self.forward(Side::Client, data.into())
    }

    /// Queue bytes for the upstream. No-op when there is no live upstream transport or `data`
    /// is empty.
    pub fn write_to_upstream(&self, data: impl Into<Bytes>) -> &Self {
        self.forward(Side::Upstream, data.into())
    }

    fn forward(&self, side: Side, data: Bytes) -> &Self {
        if data.is_empty() {
            return self;
        }

        let len = data.len();
        match self.handle(side) {
            Some(handle) if handle.write(data) => {
                let direction = match side {
                    Side::Client => "to_client",
                    Side::Upstream => "to_upstream",
                };
                SessionMetrics::record_bytes_forwarded(direction, len);
            }
            _ => {
                debug!(session_id = %self.inner.id, side = %side, bytes = len, "Write dropped, no live transport");
            }
        }
        self
    }

    /// Close both transports. Safe to call any number of times, from any path.
    pub fn destroy(&self) -> &Self {
        let previous = self.inner.mark_closed();

        let (client, upstream) = {
            let slots = self.inner.slots();
            (slots.client.clone(), slots.upstream.clone())
        };
        for handle in [client, upstream].into_iter().flatten() {
            handle.destroy();
        }

        if !self.inner.destroyed.swap(true, Ordering::SeqCst) {
            SessionMetrics::record_session_destroyed();
            info!(session_id = %self.inner.id, previous_state = %previous, "Session destroyed");
        }
        self
    }

    // ==================== Authentication & tunnel ====================

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn user(&self) -> Option<String> {
        self.inner.slots().user.clone()
    }

    /// Latch the session as authenticated for `username`. Empty or absent names are ignored.
    pub fn authenticate(&self, username: Option<&str>) -> &Self {
        match username.filter(|name| !name.is_empty()) {
            Some(name) => {
                self.inner.slots().user = Some(name.to_string());
                self.inner.authenticated.store(true, Ordering::SeqCst);
                debug!(session_id = %self.inner.id, user = %name, "Session authenticated");
            }
            None => {
                debug!(session_id = %self.inner.id, "Empty username, authentication unchanged");
            }
        }
        self
    }

    pub fn is_https(&self) -> bool {
        self.inner.https.load(Ordering::SeqCst)
    }

    /// Record that the connection entered tunnel (CONNECT) mode
    pub fn mark_https(&self) -> &Self {
        self.inner.https.store(true, Ordering::SeqCst);
        self
    }

    /// Record the CONNECT target. Ignored once the TLS upgrade has begun.
    pub fn set_tunnel_target(&self, target: TunnelTarget) -> &Self {
        let state = self.state();
        if let Some(message) = state.tunnel_change_refusal() {
            warn!(
                session_id = %self.inner.id,
                state = %state,
                address = %target.address,
                "{}",
                message
            );
            return self;
        }

        let mut slots = self.inner.slots();
        let upstream = match target.upstream {
            Some(upstream) => Some(upstream),
            None => slots.tunnel.take().and_then(|previous| previous.upstream),
        };
        slots.tunnel = Some(TunnelTarget {
            address: target.address,
            port: target.port,
            upstream,
        });
        self
    }

    pub fn tunnel_stats(&self) -> TunnelStats {
        let slots = self.inner.slots();
        match &slots.tunnel {
            Some(tunnel) => TunnelStats {
                address: Some(tunnel.address.clone()),
                port: Some(tunnel.port),
                upstream: tunnel.upstream.clone(),
            },
            None => TunnelStats::default(),
        }
    }

    /// SNI sent upstream, once the upgrade has started
    pub fn server_name(&self) -> Option<String> {
        self.inner.slots().server_name.clone()
    }

    // ==================== TLS interception ====================

    /// Wrap both transports in TLS: as server toward the client (with `pair`, or a certificate
    /// from the factory's provider for the tunnel address) and as client toward the upstream.
    ///
    /// Only the first call on a `Plain` session does anything. Handshake results, decrypted
    /// data and close events are reported through `callbacks`.
    pub fn upgrade_to_tls(&self, callbacks: InterceptCallbacks, pair: Option<CertKeyPair>) -> &Self {
        let id = self.inner.id.clone();

        let (client, upstream) = {
            let slots = self.inner.slots();
            (slots.client.clone(), slots.upstream.clone())
        };
        let (Some(client), Some(upstream)) = (client, upstream) else {
            warn!(session_id = %id, "TLS upgrade needs both transports attached, skipped");
            SessionMetrics::record_upgrade("skipped");
            return self;
        };

        if !self
            .inner
            .transition(SessionState::Plain, SessionState::Upgrading)
        {
            debug!(session_id = %id, state = %self.state(), "TLS upgrade already done or in progress");
            SessionMetrics::record_upgrade("skipped");
            return self;
        }

        self.mark_https();

        let (cert_host, server_name) = {
            let mut slots = self.inner.slots();
            let tunnel = slots.tunnel.clone();
            let address = tunnel.as_ref().map(|t| t.address.as_str());
            let server_name = SniUtils::select([
                tunnel
                    .as_ref()
                    .and_then(|t| t.upstream.as_ref())
                    .map(|u| u.host.as_str()),
                slots.upstream_host_hint.as_deref(),
                address,
            ])
            .map(str::to_string);
            let cert_host = SniUtils::select([address, server_name.as_deref()])
                .unwrap_or("localhost")
                .to_string();
            slots.server_name = server_name.clone();
            (cert_host, server_name)
        };

        info!(
            session_id = %id,
            cert_host = %cert_host,
            server_name = server_name.as_deref().unwrap_or("-"),
            "TLS upgrade started"
        );
        SessionMetrics::record_upgrade("started");

        let on_close = self.close_hook(callbacks.on_close);
        let legs_ready = Arc::new(AtomicU8::new(0));
        let interceptor = &self.inner.interceptor;

        let client_open = {
            let interceptor = Arc::clone(interceptor);
            let ready = self.leg_ready(Arc::clone(&legs_ready));
            async move {
                let raw = client.release().await.ok_or_else(|| gone(Side::Client))?;
                let tls = interceptor
                    .accept_client(raw, &cert_host, pair)
                    .await
                    .map_err(into_io)?;
                ready();
                Ok::<BoxedTransport, io::Error>(tls)
            }
        };

        let upstream_open = {
            let interceptor = Arc::clone(interceptor);
            let ready = self.leg_ready(legs_ready);
            async move {
                let raw = upstream.release().await.ok_or_else(|| gone(Side::Upstream))?;
                let server_name = server_name.ok_or_else(|| {
                    into_io(MitmError::InvalidHost("no usable upstream server name".to_string()))
                })?;
                let tls = interceptor
                    .connect_upstream(raw, &server_name)
                    .await
                    .map_err(into_io)?;
                ready();
                Ok::<BoxedTransport, io::Error>(tls)
            }
        };

        let wrapped_client = self.spawn_leg(
            Side::Client,
            client_open,
            callbacks.on_client_data,
            Arc::clone(&on_close),
        );
        let wrapped_upstream = self.spawn_leg(
            Side::Upstream,
            upstream_open,
            callbacks.on_upstream_data,
            on_close,
        );

        let mut slots = self.inner.slots();
        slots.client = Some(wrapped_client);
        slots.upstream = Some(wrapped_upstream);
        self
    }

    fn spawn_leg<F>(
        &self,
        side: Side,
        open: F,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> SocketHandle
    where
        F: Future<Output = io::Result<BoxedTransport>> + Send + 'static,
    {
        SocketHandle::spawn_pending(
            side,
            open,
            Some(SocketEvents { on_data, on_close }),
            self.inner.read_buffer_size,
        )
    }

    /// Returns a closure to call when one leg finished its handshake; the second call
    /// activates the session.
    fn leg_ready(&self, counter: Arc<AtomicU8>) -> impl FnOnce() + Send + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 < 2 {
                return;
            }
            if let Some(inner) = inner.upgrade() {
                if inner.transition(SessionState::Upgrading, SessionState::Active) {
                    info!(session_id = %inner.id, "TLS interception active");
                }
            }
        }
    }

    /// Wrap the caller's close callback so transport closes also close the session
    fn close_hook(&self, user: CloseCallback) -> CloseCallback {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |event: CloseEvent| {
            if let Some(inner) = inner.upgrade() {
                inner.mark_closed();
                match &event.reason {
                    CloseReason::Error(error) => {
                        warn!(session_id = %inner.id, side = %event.side, error = %error, "Transport failed");
                    }
                    reason => {
                        debug!(session_id = %inner.id, side = %event.side, reason = ?reason, "Transport closed");
                    }
                }
            }
            user(event);
        })
    }

    // ==================== Message reconstruction ====================

    /// Rebuild the HTTP request contained in `raw`
    pub async fn reconstruct_request(
        &self,
        raw: impl Into<Bytes>,
    ) -> Result<ReconstructedRequest, MirrorError> {
        let timeout = self.inner.reconstruct_timeout;
        self.reconstruct(MessageKind::Request, mirror::parse_request(raw.into(), timeout))
            .await
    }

    /// Rebuild the HTTP response contained in `raw`, read as the reply to a GET
    pub async fn reconstruct_response(
        &self,
        raw: impl Into<Bytes>,
    ) -> Result<ReconstructedResponse, MirrorError> {
        self.reconstruct_response_to(raw, Method::GET).await
    }

    /// Rebuild the HTTP response contained in `raw`, read as the reply to a `method` request
    pub async fn reconstruct_response_to(
        &self,
        raw: impl Into<Bytes>,
        method: Method,
    ) -> Result<ReconstructedResponse, MirrorError> {
        let timeout = self.inner.reconstruct_timeout;
        self.reconstruct(
            MessageKind::Response,
            mirror::parse_response(raw.into(), method, timeout),
        )
        .await
    }

    async fn reconstruct<T, F>(&self, kind: MessageKind, parse: F) -> Result<T, MirrorError>
    where
        F: Future<Output = Result<T, MirrorError>>,
    {
        let result = match self.begin(kind) {
            Ok(_guard) => {
                let closed = wait_closed(self.inner.closed.subscribe());
                tokio::select! {
                    result = parse => result,
                    _ = closed => Err(MirrorError::SessionClosed),
                }
            }
            Err(e) => Err(e),
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        SessionMetrics::record_reconstruction(kind.label(), label);
        if let Err(e) = &result {
            debug!(session_id = %self.inner.id, kind = kind.label(), error = %e, "Reconstruction failed");
        }
        result
    }

    fn begin(&self, kind: MessageKind) -> Result<InFlight<'_>, MirrorError> {
        if self.state() == SessionState::Closed {
            return Err(MirrorError::SessionClosed);
        }

        let side = kind.side();
        if self.handle(side).is_none() {
            return Err(MirrorError::NotAttached(match side {
                Side::Client => "client",
                Side::Upstream => "upstream",
            }));
        }

        let flag = match kind {
            MessageKind::Request => &self.inner.request_in_flight,
            MessageKind::Response => &self.inner.response_in_flight,
        };
        if flag.swap(true, Ordering::SeqCst) {
            return Err(MirrorError::Busy(kind.label()));
        }
        Ok(InFlight(flag))
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

fn gone(side: Side) -> io::Error {
    into_io(MitmError::TransportUnavailable(side))
}

fn into_io(error: MitmError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

/// Creates sessions sharing one configuration, certificate provider and upstream TLS config
#[derive(Clone)]
pub struct SessionFactory {
    config: SessionConfig,
    interceptor: Arc<TlsInterceptor>,
}

impl SessionFactory {
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn CertificateProvider>,
    ) -> Result<Self, MitmError> {
        let interceptor = Arc::new(TlsInterceptor::new(&config, provider)?);
        Ok(Self {
            config,
            interceptor,
        })
    }

    /// Validate `config` and build the certificate provider it describes
    pub fn from_config(config: SessionConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let provider = config.certificate_provider()?;
        Self::new(config, provider).context("Failed to initialize TLS interceptor")
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_config(SessionConfig::from_env()?)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn create(&self, id: impl Into<String>) -> Session {
        Session::new(id, &self.config, Arc::clone(&self.interceptor))
    }

    pub fn create_with_generated_id(&self) -> Session {
        self.create(Uuid::new_v4().to_string())
    }
}
