//! Adapter over the yamux session multiplexer.
//!
//! A multiplexed session runs over one transport connection. The client side opens streams with a
//! [`MuxClient`], the server side accepts them with a [`MuxServer`]. Streams are exposed as tokio
//! byte streams, so the relay code doesn't know whether it's talking to a stream or to a plain
//! transport connection.

use std::{
    collections::VecDeque,
    fmt,
    future::poll_fn,
    io::{self, ErrorKind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::{
    compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    config::{MuxConfig, MAX_STREAMS_PER_SESSION},
    error::{Error, Result},
    relay::copy::is_routine_close,
    transport::BoxedStream,
};

type SessionConnection = yamux::Connection<Compat<BoxedStream>>;
type OpenReply = oneshot::Sender<Result<MuxStream>>;

/// The smallest per-stream window yamux accepts.
const MIN_STREAM_WINDOW: usize = 256 * 1024;

/// How many streams yamux tracks per session. Dropped streams are only forgotten by yamux once
/// the session is polled again, so this stays well above [`MAX_STREAMS_PER_SESSION`]. Exceeding it
/// on the accepting side terminates the whole session.
const YAMUX_STREAM_SLOTS: usize = 2 * MAX_STREAMS_PER_SESSION;

/// How many streams a client can open over the lifetime of a session. Client stream ids are odd
/// 32-bit numbers, and yamux refuses to hand out the last one.
pub const MAX_OUTBOUND_STREAM_IDS: u32 = u32::MAX >> 1;

/// How many stream open requests can wait for the driver before `open_stream` waits.
const MAX_PENDING_OPENS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Builds the yamux configuration for a session.
///
/// yamux grows each stream's receive window on demand up to the connection window divided among
/// the open streams, so the per-stream buffer is expressed through the connection window.
/// yamux never sends keep-alive pings.
pub fn yamux_config(config: &MuxConfig) -> yamux::Config {
    let stream_window = config.max_stream_receive_buffer.max(MIN_STREAM_WINDOW);

    // The window must be raised before the stream count, yamux checks one against the other.
    let mut yamux_config = yamux::Config::default();
    yamux_config.set_max_connection_receive_window(Some(stream_window.saturating_mul(YAMUX_STREAM_SLOTS)));
    yamux_config.set_max_num_streams(YAMUX_STREAM_SLOTS);
    yamux_config
}

fn is_peer_gone(error: &io::Error) -> bool {
    is_routine_close(error)
        || matches!(
            error.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        )
}

/// Maps a yamux failure, treating the transport going away as the session closing.
fn session_error(error: yamux::ConnectionError) -> Error {
    match error {
        yamux::ConnectionError::Io(io_error) if is_peer_gone(&io_error) => Error::SessionClosed,
        error => Error::from(error),
    }
}

/// A stream of a multiplexed session.
///
/// Streams opened by a [`MuxClient`] count against the session's open stream limit until dropped.
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MuxStream {
    fn new(stream: yamux::Stream, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            inner: stream.compat(),
            _permit: permit,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Limits on the streams a [`MuxClient`] opens. Reaching one fails the stream being opened and
/// leaves the session and its other streams alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Streams open at the same time.
    pub max_open_streams: usize,

    /// Streams opened over the lifetime of the session.
    pub max_stream_ids: u32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_open_streams: MAX_STREAMS_PER_SESSION,
            max_stream_ids: MAX_OUTBOUND_STREAM_IDS,
        }
    }
}

/// The opening side of a multiplexed session.
///
/// Cloning the handle is cheap. The session stays open until every handle is dropped or the
/// transport fails.
#[derive(Clone)]
pub struct MuxClient {
    requests: mpsc::Sender<OpenReply>,
    closed: CancellationToken,
}

impl MuxClient {
    /// Starts a client session over `transport`, spawning the task that drives it.
    pub fn new(transport: BoxedStream, config: &MuxConfig) -> Self {
        Self::with_limits(transport, config, StreamLimits::default())
    }

    pub fn with_limits(transport: BoxedStream, config: &MuxConfig, limits: StreamLimits) -> Self {
        let connection = yamux::Connection::new(transport.compat(), yamux_config(config), yamux::Mode::Client);
        let (requests, receiver) = mpsc::channel(MAX_PENDING_OPENS);
        let closed = CancellationToken::new();

        tokio::spawn(drive_client(connection, receiver, limits, closed.clone()));
        Self { requests, closed }
    }

    /// Opens a new stream on the session.
    ///
    /// Fails with [`Error::TooManyStreams`] while the session has as many open streams as it
    /// allows, with [`Error::StreamIdsExhausted`] once the session ran out of stream identifiers,
    /// and with [`Error::SessionClosed`] once the session is gone. Failures are not retried.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let (reply, response) = oneshot::channel();
        self.requests.send(reply).await.map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    pub fn state(&self) -> SessionState {
        match self.closed.is_cancelled() {
            true => SessionState::Closed,
            false => SessionState::Open,
        }
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Checks the limits for one more stream, without touching the session. yamux closes the whole
/// session when it refuses to open a stream.
fn admit_stream(permits: &Arc<Semaphore>, ids_used: u32, limits: &StreamLimits) -> Result<OwnedSemaphorePermit> {
    if ids_used >= limits.max_stream_ids {
        return Err(Error::StreamIdsExhausted);
    }

    Arc::clone(permits).try_acquire_owned().map_err(|_| Error::TooManyStreams)
}

async fn drive_client(
    mut connection: SessionConnection,
    mut requests: mpsc::Receiver<OpenReply>,
    limits: StreamLimits,
    closed: CancellationToken,
) {
    let _closed_guard = closed.drop_guard();
    let permits = Arc::new(Semaphore::new(limits.max_open_streams));
    let mut ids_used = 0u32;
    let mut pending: VecDeque<OpenReply> = VecDeque::new();
    let mut handles_alive = true;

    let result = poll_fn(|cx| {
        while handles_alive {
            match requests.poll_recv(cx) {
                Poll::Ready(Some(reply)) => pending.push_back(reply),
                Poll::Ready(None) => handles_alive = false,
                Poll::Pending => break,
            }
        }

        while let Some(reply) = pending.pop_front() {
            let permit = match admit_stream(&permits, ids_used, &limits) {
                Ok(permit) => permit,
                Err(error) => {
                    let _ = reply.send(Err(error));
                    continue;
                }
            };

            match connection.poll_new_outbound(cx) {
                Poll::Pending => {
                    pending.push_front(reply);
                    break;
                }
                Poll::Ready(Ok(stream)) => {
                    ids_used += 1;
                    let _ = reply.send(Ok(MuxStream::new(stream, Some(permit))));
                }
                Poll::Ready(Err(error)) => {
                    let _ = reply.send(Err(Error::SessionClosed));
                    return Poll::Ready(Err(session_error(error)));
                }
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    debug!("Refusing stream opened by the server");
                    drop(stream);
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(session_error(error))),
                Poll::Ready(None) => return Poll::Ready(Err(Error::SessionClosed)),
                Poll::Pending => break,
            }
        }

        match !handles_alive && pending.is_empty() {
            true => Poll::Ready(Ok(())),
            false => Poll::Pending,
        }
    })
    .await;

    match result {
        Ok(()) => {
            debug!("Every session handle was dropped, closing the session");
            if let Err(error) = poll_fn(|cx| connection.poll_close(cx)).await {
                debug!("Error while closing the session: {error}");
            }
        }
        Err(Error::SessionClosed) => debug!("Session closed by the peer"),
        Err(error) => warn!("Session failed: {error}"),
    }
}

/// The accepting side of a multiplexed session.
///
/// The session only makes progress while [`MuxServer::accept_stream`] is being awaited, so
/// streams must be handed off to other tasks and the next stream accepted right away.
pub struct MuxServer {
    connection: SessionConnection,
}

impl MuxServer {
    pub fn new(transport: BoxedStream, config: &MuxConfig) -> Self {
        Self {
            connection: yamux::Connection::new(transport.compat(), yamux_config(config), yamux::Mode::Server),
        }
    }

    /// Waits for the peer to open the next stream. Returns `Ok(None)` once the peer closed the
    /// session or its transport went away.
    pub async fn accept_stream(&mut self) -> Result<Option<MuxStream>> {
        match poll_fn(|cx| self.connection.poll_next_inbound(cx)).await {
            Some(Ok(stream)) => Ok(Some(MuxStream::new(stream, None))),
            Some(Err(error)) => match session_error(error) {
                Error::SessionClosed => Ok(None),
                error => Err(error),
            },
            None => Ok(None),
        }
    }
}
