//! The accept loop shared by the client's local listener and the server's transport listener.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{Error, Result},
    transport::BoxedStream,
};

/// How long to pause after an accept failure caused by resource exhaustion.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A source of incoming byte streams.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// How an accept error affects the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// Accepting can continue right away.
    Transient,

    /// Accepting can continue after a pause.
    ResourceExhausted,

    /// The listener is unusable.
    Fatal,
}

pub fn classify_accept_error(error: &io::Error) -> AcceptFailure {
    if let Some(code) = error.raw_os_error() {
        if code == EMFILE || code == ENFILE || code == ENOBUFS {
            return AcceptFailure::ResourceExhausted;
        }
    }

    match error.kind() {
        ErrorKind::OutOfMemory => AcceptFailure::ResourceExhausted,
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut => AcceptFailure::Transient,
        _ => AcceptFailure::Fatal,
    }
}

/// Accepts connections from `listener` until it fails or `shutdown` is cancelled.
///
/// Every accepted connection is passed to `dispatch`, which must hand it off without blocking
/// (typically by spawning a task) so the next connection can be accepted right away. Transient
/// failures are logged and skipped. A fatal failure ends the loop with [`Error::Accept`], while
/// cancellation ends it with `Ok(())`.
pub async fn accept_loop<L, F>(listener: &mut L, shutdown: &CancellationToken, mut dispatch: F) -> Result<()>
where
    L: Listener + ?Sized,
    F: FnMut(BoxedStream, SocketAddr),
{
    loop {
        let accept_result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Accept loop cancelled");
                return Ok(());
            }
            result = listener.accept() => result,
        };

        let error = match accept_result {
            Ok((stream, address)) => {
                debug!("Accepted connection from {address}");
                dispatch(stream, address);
                continue;
            }
            Err(error) => error,
        };

        match classify_accept_error(&error) {
            AcceptFailure::Transient => warn!("Temporary error while accepting connection: {error}"),
            AcceptFailure::ResourceExhausted => {
                warn!("Out of resources while accepting connection, pausing: {error}");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            AcceptFailure::Fatal => {
                error!("Failed to accept connection: {error}");
                return Err(Error::Accept(error));
            }
        }
    }
}
