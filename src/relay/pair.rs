use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

use super::copy::{copy_loop, CopyOutcome};

/// Relays one local connection to one remote stream until the copy loop ends, then closes both.
///
/// Ownership of both streams is taken so that they're closed exactly once, when this function
/// returns, no matter how the copy loop ended.
pub async fn relay_pair<L, R>(mut local: L, mut remote: R, shutdown: &CancellationToken) -> CopyOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = copy_loop(&mut local, &mut remote, shutdown).await;
    drop(remote);
    drop(local);
    outcome
}

/// Opens the remote side of a pair and relays `local` to it.
///
/// If opening the remote side fails, `local` is closed without any data being copied and the
/// error is returned for the caller to log. Returns `Ok(None)` if `shutdown` fired before the
/// remote side was open.
pub async fn open_and_relay<L, R, F>(local: L, open_remote: F, shutdown: &CancellationToken) -> Result<Option<CopyOutcome>>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
    F: Future<Output = Result<R>>,
{
    let remote = tokio::select! {
        result = open_remote => result,
        _ = shutdown.cancelled() => {
            debug!("Shutdown requested before the remote side was open");
            return Ok(None);
        }
    };

    match remote {
        Ok(remote) => Ok(Some(relay_pair(local, remote, shutdown).await)),
        Err(error) => {
            drop(local);
            Err(error)
        }
    }
}
