//! Socket facade
//!
//! Every transport attached to a session is owned by a single driver task. The rest of the
//! crate talks to that task through a [`SocketHandle`]:
//!
//! - `write` queues bytes, which the driver writes in call order without holding up reads
//! - `destroy` shuts the endpoint down; repeated calls are no-ops
//! - `release` hands the raw endpoint back so it can be wrapped in TLS
//!
//! Writing to or destroying a dead endpoint never fails and has no effect.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

/// Any duplex byte stream a session can own
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport (plain TCP, TLS-wrapped, in-memory pipe...)
pub type BoxedTransport = Box<dyn Transport>;

/// Called with each chunk of data read from a transport
pub type DataCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Called once when a transport closes or fails
pub type CloseCallback = Arc<dyn Fn(CloseEvent) + Send + Sync>;

/// Which leg of the session a transport belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Browser/client-facing leg
    Client,
    /// Destination-facing leg
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Upstream => f.write_str("upstream"),
        }
    }
}

/// Why a transport stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection
    Closed,
    /// Closed locally through `destroy`
    Destroyed,
    /// Handshake or I/O failure
    Error(String),
}

/// Close notification delivered to a [`CloseCallback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub side: Side,
    pub reason: CloseReason,
}

impl CloseEvent {
    pub fn is_error(&self) -> bool {
        matches!(self.reason, CloseReason::Error(_))
    }
}

/// Read-side listeners for a driven transport
#[derive(Clone)]
pub struct SocketEvents {
    pub on_data: DataCallback,
    pub on_close: CloseCallback,
}

enum Command {
    Write(Bytes),
    Release(oneshot::Sender<BoxedTransport>),
}

struct Shared {
    side: Side,
    commands: mpsc::UnboundedSender<Command>,
    destroyed: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn mark_dead(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Cloneable handle to a driven transport
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("side", &self.shared.side)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl SocketHandle {
    /// Drive an already-open transport. Nothing is read from it; it only accepts writes.
    pub fn spawn<T: Transport>(side: Side, io: T, read_buffer_size: usize) -> Self {
        let io: BoxedTransport = Box::new(io);
        Self::spawn_pending(side, async move { Ok(io) }, None, read_buffer_size)
    }

    /// Drive a transport that is still being opened (e.g. a TLS handshake in progress).
    ///
    /// Writes issued before `open` resolves are buffered and flushed once it does. If `events`
    /// is set, the driver also reads from the transport and reports data and close events.
    pub fn spawn_pending<F>(
        side: Side,
        open: F,
        events: Option<SocketEvents>,
        read_buffer_size: usize,
    ) -> Self
    where
        F: Future<Output = io::Result<BoxedTransport>> + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            side,
            commands,
            destroyed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        tokio::spawn(drive(
            Arc::clone(&shared),
            open,
            rx,
            events,
            read_buffer_size.max(1),
        ));

        Self { shared }
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Queue bytes for the endpoint. Returns `false` (and does nothing) when the endpoint is
    /// gone or `data` is empty.
    pub fn write(&self, data: Bytes) -> bool {
        if data.is_empty() || self.is_destroyed() {
            return false;
        }
        self.shared.commands.send(Command::Write(data)).is_ok()
    }

    /// Close the endpoint. Returns `true` only for the call that actually closed it.
    pub fn destroy(&self) -> bool {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.shutdown.notify_one();
        true
    }

    /// Whether the endpoint was destroyed, released, or its driver has exited
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst) || self.shared.commands.is_closed()
    }

    /// Take the raw endpoint back from the driver, after every queued write has been flushed.
    ///
    /// The handle is dead afterwards. Returns `None` if the endpoint is already gone.
    pub async fn release(&self) -> Option<BoxedTransport> {
        if self.is_destroyed() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.shared.commands.send(Command::Release(tx)).ok()?;
        rx.await.ok()
    }
}

fn emit(events: &Option<SocketEvents>, side: Side, reason: CloseReason) {
    if let Some(events) = events {
        (events.on_close)(CloseEvent { side, reason });
    }
}

enum Progress {
    Wrote(usize),
    Flushed,
}

/// Advance the write side by one step: part of `chunk`, or a flush once nothing is queued
async fn push<W>(writer: &mut W, chunk: Option<&Bytes>) -> io::Result<Progress>
where
    W: AsyncWrite + Unpin,
{
    match chunk {
        Some(chunk) => match writer.write(chunk).await? {
            0 => Err(io::ErrorKind::WriteZero.into()),
            n => Ok(Progress::Wrote(n)),
        },
        None => writer.flush().await.map(|()| Progress::Flushed),
    }
}

async fn drive<F>(
    shared: Arc<Shared>,
    open: F,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: Option<SocketEvents>,
    read_buffer_size: usize,
) where
    F: Future<Output = io::Result<BoxedTransport>> + Send + 'static,
{
    let side = shared.side;

    let io = tokio::select! {
        biased;
        _ = shared.shutdown.notified() => {
            debug!(side = %side, "Transport destroyed before it was opened");
            emit(&events, side, CloseReason::Destroyed);
            return;
        }
        opened = open => match opened {
            Ok(io) => io,
            Err(e) => {
                shared.mark_dead();
                debug!(side = %side, error = %e, "Transport failed to open");
                emit(&events, side, CloseReason::Error(e.to_string()));
                return;
            }
        },
    };

    // Reads keep flowing while queued writes wait on a slow peer.
    let (mut reader, mut writer) = tokio::io::split(io);
    let reading = events.is_some();
    let mut buf = vec![0u8; read_buffer_size];
    let mut queue: VecDeque<Bytes> = VecDeque::new();
    let mut dirty = false;
    let mut releasing: Option<oneshot::Sender<BoxedTransport>> = None;

    loop {
        if queue.is_empty() && !dirty {
            if let Some(reply) = releasing.take() {
                shared.mark_dead();
                if reply.send(reader.unsplit(writer)).is_err() {
                    debug!(side = %side, "Released transport was dropped by the receiver");
                }
                return;
            }
        }

        tokio::select! {
            biased;
            _ = shared.shutdown.notified() => {
                let _ = writer.shutdown().await;
                debug!(side = %side, dropped = queue.len(), "Transport destroyed");
                emit(&events, side, CloseReason::Destroyed);
                break;
            }
            command = commands.recv(), if releasing.is_none() => match command {
                Some(Command::Write(data)) => queue.push_back(data),
                Some(Command::Release(reply)) => releasing = Some(reply),
                None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            progress = push(&mut writer, queue.front()), if !queue.is_empty() || dirty => match progress {
                Ok(Progress::Wrote(n)) => {
                    dirty = true;
                    if let Some(front) = queue.front_mut() {
                        front.advance(n);
                        if front.is_empty() {
                            queue.pop_front();
                        }
                    }
                }
                Ok(Progress::Flushed) => dirty = false,
                Err(e) => {
                    shared.mark_dead();
                    debug!(side = %side, error = %e, "Write failed");
                    emit(&events, side, CloseReason::Error(e.to_string()));
                    break;
                }
            },
            read = reader.read(&mut buf), if reading => match read {
                Ok(0) => {
                    shared.mark_dead();
                    debug!(side = %side, "Peer closed transport");
                    emit(&events, side, CloseReason::Closed);
                    break;
                }
                Ok(n) => {
                    if let Some(events) = &events {
                        (events.on_data)(Bytes::copy_from_slice(&buf[..n]));
                    }
                }
                Err(e) => {
                    shared.mark_dead();
                    debug!(side = %side, error = %e, "Read failed");
                    emit(&events, side, CloseReason::Error(e.to_string()));
                    break;
                }
            },
        }
    }
}
