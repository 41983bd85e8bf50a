//! # Framed Connection
//!
//! Purpose: Own one TCP socket and turn it into two independent streams of
//! frames: an inbound stream handed to a dispatcher and an outbound queue
//! drained by a writer task.
//!
//! ## Design Principles
//! 1. **Split Ownership**: The socket is split; the receive task owns the read
//!    half and the send task owns the write half, so neither blocks the other.
//! 2. **Bounded Everything**: Outbound frames go through a bounded queue
//!    (backpressure on senders) and inbound frames through a bounded worker
//!    pool. When every worker is busy a frame either waits in its own task or
//!    is dropped, per [`Overflow`]; the reader never waits.
//! 3. **Fail Closed**: Any framing violation ends the connection. There is no
//!    resync marker in the protocol, so a desynchronized stream is unusable.
//! 4. **Panic Isolation**: Handler panics are caught at the dispatch boundary
//!    and never reach the receive loop.
//!
//! ## Lifecycle
//!
//! ```text
//! connect()/from_stream() ──> Connected ──close()──> Closing ──send loop exits──> Closed
//!                                 │                     ▲
//!                                 └── read/write error ─┘
//! ```

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, warn};

use crate::config::{ConnectionConfig, FrameLimits};
use crate::error::ProtocolError;
use crate::protocol::{FramePrefix, ETX, PREFIX_LEN};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Returned by [`Connection::send`] once the connection is closing or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Consumer of complete inbound frames.
///
/// Implementations decode the frame themselves; the receive loop only
/// guarantees that the prefix and terminator were valid.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, frame: Bytes, conn: Arc<Connection>) -> BoxFuture<'a, ()>;
}

/// What [`Dispatcher::dispatch`] does with a frame while every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Park the frame in its own task until a worker frees up.
    #[default]
    Wait,
    /// Drop the frame and log it.
    Drop,
}

/// Bounded worker pool that runs a [`FrameHandler`] off the receive path.
///
/// One dispatcher is usually shared by every connection of a client or a
/// served service, so the worker bound applies across all of them.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn FrameHandler>,
    workers: Arc<Semaphore>,
    overflow: Overflow,
}

impl Dispatcher {
    /// Dispatcher that never loses a frame ([`Overflow::Wait`]).
    pub fn new(handler: Arc<dyn FrameHandler>, workers: usize) -> Self {
        Dispatcher::with_overflow(handler, workers, Overflow::Wait)
    }

    pub fn with_overflow(handler: Arc<dyn FrameHandler>, workers: usize, overflow: Overflow) -> Self {
        Dispatcher {
            handler,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            overflow,
        }
    }

    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    /// Number of idle workers.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Hands one frame to a worker without blocking the caller.
    ///
    /// Returns `false` only when the frame was dropped under
    /// [`Overflow::Drop`].
    pub fn dispatch(&self, frame: Bytes, conn: Arc<Connection>) -> bool {
        let ready = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if self.overflow == Overflow::Drop => {
                warn!(peer = %conn.peer(), "dispatch pool exhausted, dropping frame");
                return false;
            }
            Err(_) => None,
        };

        let handler = self.handler.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let _permit = match ready {
                Some(permit) => permit,
                None => match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let peer = conn.peer();
            let outcome = AssertUnwindSafe(handler.handle(frame, conn)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(%peer, panic = panic_message(panic.as_ref()), "frame handler panicked");
            }
        });
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One TCP connection carrying framed messages in both directions.
///
/// Always handled as `Arc<Connection>`; clones share the same socket.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    created_at: Instant,
    state: AtomicU8,
    outbound: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Dials `addr` (host:port) and starts the receive and send tasks.
    ///
    /// **Logic**:
    /// 1. Resolve and dial with keep-alive enabled, bounded by `connect_timeout`.
    /// 2. Disable Nagle so small frames are not coalesced.
    /// 3. Split the socket and spawn exactly one reader and one writer.
    pub async fn connect(addr: &str, config: &ConnectionConfig, dispatcher: Dispatcher) -> io::Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connect_timeout, dial(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
        Self::from_stream(stream, config, dispatcher)
    }

    /// Wraps an already-connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: TcpStream, config: &ConnectionConfig, dispatcher: Dispatcher) -> io::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(config.write_queue.max(1));
        let (close_tx, _) = watch::channel(false);

        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            created_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            outbound,
            close_tx,
        });

        tokio::spawn(receive_loop(
            conn.clone(),
            reader,
            config.limits,
            dispatcher,
            conn.close_tx.subscribe(),
        ));
        tokio::spawn(send_loop(
            conn.clone(),
            writer,
            outbound_rx,
            conn.close_tx.subscribe(),
        ));

        debug!(id = conn.id, %peer, "connection established");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once `close` was called or either task hit an error.
    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Connected
    }

    /// Queues a frame for the send task.
    ///
    /// Waits only while the outbound queue is full. Fails without queuing once
    /// the connection is closing.
    pub async fn send(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
        if self.is_closed() {
            debug!(id = self.id, peer = %self.peer, "send on closed connection ignored");
            return Err(ConnectionClosed);
        }
        self.outbound.send(frame).await.map_err(|_| ConnectionClosed)
    }

    /// Starts teardown. Idempotent.
    pub fn close(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            debug!(id = self.id, peer = %self.peer, "closing connection");
            self.close_tx.send_replace(true);
        }
    }
}

async fn dial(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in lookup_host(addr).await? {
        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(resolved).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address resolved for {addr}"))
    }))
}

#[derive(Debug, Error)]
enum ReadError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads one frame. `Ok(None)` means the peer closed the stream.
async fn read_frame(reader: &mut OwnedReadHalf, limits: &FrameLimits) -> Result<Option<Bytes>, ReadError> {
    let mut prefix = [0u8; PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    // Lengths are checked before anything else is read or allocated.
    let parsed = FramePrefix::parse(&prefix, limits)?;
    let mut frame = BytesMut::zeroed(parsed.frame_len());
    frame[..PREFIX_LEN].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[PREFIX_LEN..]).await?;

    let etx = frame[frame.len() - 1];
    if etx != ETX {
        return Err(ProtocolError::BadEtx(etx).into());
    }
    Ok(Some(frame.freeze()))
}

async fn receive_loop(
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    limits: FrameLimits,
    dispatcher: Dispatcher,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            next = read_frame(&mut reader, &limits) => next,
            _ = closed.wait_for(|closed| *closed) => break,
        };
        match next {
            Ok(Some(frame)) => {
                dispatcher.dispatch(frame, conn.clone());
            }
            Ok(None) => {
                debug!(id = conn.id, peer = %conn.peer, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(id = conn.id, peer = %conn.peer, error = %err, "tearing down connection");
                break;
            }
        }
    }
    conn.close();
}

async fn send_loop(
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            next = outbound.recv() => next,
        };
        let Some(frame) = next else { break };
        if let Err(err) = writer.write_all(&frame).await {
            warn!(id = conn.id, peer = %conn.peer, error = %err, "write failed");
            break;
        }
    }

    conn.close();
    let _ = writer.shutdown().await;
    conn.state.store(ConnectionState::Closed as u8, Ordering::Release);
    debug!(id = conn.id, peer = %conn.peer, "send loop exited");
}
