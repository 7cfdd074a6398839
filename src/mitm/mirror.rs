//! Message Mirror - rebuild HTTP messages from captured bytes
//!
//! Raw bytes taken off an intercepted connection are replayed into hyper's own HTTP/1
//! connection machinery through an in-memory [`MirrorStream`] instead of a socket, so the
//! result goes through the same framing rules (content-length, chunked, trailers) that a live
//! connection would.
//!
//! - Requests: the stream is served by a one-shot hyper server connection and the first
//!   request it yields is captured.
//! - Responses: the stream is handed to a hyper client connection. A probe request is written
//!   into the mirror (and discarded), and the injected bytes are read back as its reply.
//!
//! A response mirror is sealed once the captured bytes are fed, so a body delimited by
//! connection close ends where the capture ends. Request mirrors never report EOF.
//!
//! Each parse resolves a single [`Completion`]. The mirror and its connection are dropped
//! as soon as it resolves.

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tracing::debug;

/// Request rebuilt from raw bytes, body fully de-framed
pub type ReconstructedRequest = Request<Bytes>;

/// Response rebuilt from raw bytes, body fully de-framed
pub type ReconstructedResponse = Response<Bytes>;

/// Reconstruction errors
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Incomplete HTTP message after {0:?}")]
    Incomplete(Duration),

    #[error("HTTP parse failed: {0}")]
    Parse(String),

    #[error("A {0} reconstruction is already in flight for this session")]
    Busy(&'static str),

    #[error("No {0} transport attached to this session")]
    NotAttached(&'static str),

    #[error("Session closed before the message was reconstructed")]
    SessionClosed,

    #[error("Mirror connection dropped without producing a message")]
    Abandoned,
}

impl MirrorError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Incomplete(_) => "incomplete",
            Self::Parse(_) => "parse",
            Self::Busy(_) => "busy",
            Self::NotAttached(_) => "not_attached",
            Self::SessionClosed => "session_closed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Which end of an HTTP exchange the mirror impersonates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorRole {
    /// Bytes are readable immediately (request parsing)
    Server,
    /// Bytes become readable only after the probe request was written (response parsing)
    Client,
}

#[derive(Default)]
struct MirrorState {
    inbound: BytesMut,
    released: bool,
    sealed: bool,
    written: usize,
    reader: Option<Waker>,
}

/// Feeding side of an in-memory duplex endpoint
#[derive(Clone)]
pub struct MessageMirror {
    state: Arc<Mutex<MirrorState>>,
}

impl MessageMirror {
    pub fn new(role: MirrorRole) -> Self {
        let state = MirrorState {
            released: role == MirrorRole::Server,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Inject bytes as if they had arrived from the network
    pub fn feed(&self, data: &[u8]) {
        let mut state = lock(&self.state);
        state.inbound.extend_from_slice(data);
        if state.released {
            if let Some(waker) = state.reader.take() {
                waker.wake();
            }
        }
    }

    /// No more bytes will be fed: once drained, reads report EOF
    pub fn seal(&self) {
        let mut state = lock(&self.state);
        state.sealed = true;
        if state.released {
            if let Some(waker) = state.reader.take() {
                waker.wake();
            }
        }
    }

    /// Bytes injected but not yet consumed
    pub fn pending(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Bytes the parser wrote into the mirror (and that were discarded)
    pub fn written(&self) -> usize {
        lock(&self.state).written
    }

    /// The stream end handed to hyper
    pub fn stream(&self) -> MirrorStream {
        MirrorStream {
            state: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<MirrorState>) -> MutexGuard<'_, MirrorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stream end of a [`MessageMirror`]. Reads drain injected bytes, writes are discarded.
pub struct MirrorStream {
    state: Arc<Mutex<MirrorState>>,
}

impl AsyncRead for MirrorStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = lock(&self.state);
        if state.released && state.sealed && state.inbound.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if !state.released || state.inbound.is_empty() {
            // Unsealed: an incomplete message keeps the parser waiting.
            state.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = state.inbound.len().min(buf.remaining());
        buf.put_slice(&state.inbound[..n]);
        state.inbound.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MirrorStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = lock(&self.state);
        state.written += data.len();
        if !state.released {
            state.released = true;
            if let Some(waker) = state.reader.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Resolving side of a [`Completion`]. Clones share one slot; the first value wins.
pub struct Resolver<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Resolver<T> {
    /// Deliver the value. Returns `false` if the completion was already resolved or dropped.
    pub fn resolve(&self, value: T) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

/// Single-resolution future bridging a parser callback to `async` code
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, Resolver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self { rx },
            Resolver {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
        )
    }

    /// Wait for the value. `Ok(None)` when every resolver was dropped unused,
    /// `Err(Incomplete)` when `timeout` elapses first.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Option<T>, MirrorError> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rx).await {
                Ok(value) => Ok(value.ok()),
                Err(_) => Err(MirrorError::Incomplete(limit)),
            },
            None => Ok(self.rx.await.ok()),
        }
    }
}

/// Input that ran out mid-message is incomplete, anything else hyper rejects is malformed
fn classify(error: hyper::Error, started: Instant) -> MirrorError {
    if truncated(&error) {
        MirrorError::Incomplete(started.elapsed())
    } else {
        MirrorError::Parse(error.to_string())
    }
}

fn truncated(error: &hyper::Error) -> bool {
    if error.is_incomplete_message() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

async fn settle<T>(
    completion: Completion<Result<T, MirrorError>>,
    timeout: Option<Duration>,
) -> Result<T, MirrorError> {
    completion.wait(timeout).await?.unwrap_or(Err(MirrorError::Abandoned))
}

/// Parse the first HTTP/1 request contained in `raw`
pub async fn parse_request(
    raw: Bytes,
    timeout: Option<Duration>,
) -> Result<ReconstructedRequest, MirrorError> {
    let mirror = MessageMirror::new(MirrorRole::Server);
    mirror.feed(&raw);

    let (completion, resolver) = Completion::new();

    let on_request = resolver.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let resolver = on_request.clone();
        async move {
            let (parts, body) = req.into_parts();
            let message = match body.collect().await {
                Ok(collected) => Ok(Request::from_parts(parts, collected.to_bytes())),
                Err(e) => Err(MirrorError::Parse(e.to_string())),
            };
            resolver.resolve(message);
            Ok::<_, Infallible>(Response::new(Empty::<Bytes>::new()))
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(mirror.stream()), service);

    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Request mirror connection failed");
            resolver.resolve(Err(MirrorError::Parse(e.to_string())));
        }
    });

    let result = settle(completion, timeout).await;
    driver.abort();
    result
}

/// Parse the HTTP/1 response contained in `raw`, read as the reply to a `method` request
pub async fn parse_response(
    raw: Bytes,
    method: Method,
    timeout: Option<Duration>,
) -> Result<ReconstructedResponse, MirrorError> {
    let started = Instant::now();
    let mirror = MessageMirror::new(MirrorRole::Client);
    mirror.feed(&raw);
    mirror.seal();

    let (completion, resolver) = Completion::new();

    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(mirror.stream()))
            .await
            .map_err(|e| MirrorError::Parse(e.to_string()))?;

    let connection_failed = resolver.clone();
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Response mirror connection failed");
            connection_failed.resolve(Err(classify(e, started)));
        }
    });

    let probe = Request::builder()
        .method(method)
        .uri("/")
        .header(http::header::HOST, "mirror.invalid")
        .body(Empty::<Bytes>::new())
        .map_err(|e| MirrorError::Parse(e.to_string()))?;

    let exchange = tokio::spawn(async move {
        let message = match sender.send_request(probe).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                body.collect()
                    .await
                    .map(|collected| Response::from_parts(parts, collected.to_bytes()))
                    .map_err(|e| classify(e, started))
            }
            Err(e) => Err(classify(e, started)),
        };
        resolver.resolve(message);
    });

    let result = settle(completion, timeout).await;
    exchange.abort();
    driver.abort();
    result
}
