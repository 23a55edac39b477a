//! The bidirectional copy primitive that every relayed connection runs on.

use std::{fmt, io};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Size of the buffer used by each copy direction.
pub const COPY_BUFFER_SIZE: usize = 2 * 1024;

/// How one copy direction ended.
#[derive(Debug)]
pub enum DirectionEnd {
    /// The source reached end of stream and the destination was half-closed.
    Eof,

    /// Reading, writing or half-closing failed.
    Failed(io::Error),
}

/// What one copy direction did before the copy loop returned.
#[derive(Debug, Default)]
pub struct DirectionReport {
    /// Bytes written to the destination.
    pub bytes: u64,

    /// `None` if the direction was still running when the copy loop returned.
    pub end: Option<DirectionEnd>,
}

impl DirectionReport {
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    pub fn failed(&self) -> bool {
        matches!(self.end, Some(DirectionEnd::Failed(_)))
    }
}

/// Why the copy loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// Both directions reached end of stream.
    BothFinished,

    /// One of the directions failed.
    DirectionFailed,

    /// The external shutdown signal fired.
    Cancelled,
}

impl fmt::Display for CopyEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BothFinished => write!(f, "both directions finished"),
            Self::DirectionFailed => write!(f, "a direction failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct CopyOutcome {
    pub end: CopyEnd,
    pub a_to_b: DirectionReport,
    pub b_to_a: DirectionReport,
}

/// Returns whether an I/O error is the expected result of the paired stream being torn down,
/// rather than a transport fault.
pub fn is_routine_close(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::WriteZero
    )
}

/// Pipes bytes from `a` to `b` and from `b` to `a` concurrently.
///
/// A direction that reaches end of stream half-closes its destination and leaves the other
/// direction running. Returns as soon as either direction fails, both directions finish, or
/// `shutdown` is cancelled. A direction still in progress at that point is abandoned; closing the
/// streams is up to the caller.
pub async fn copy_loop<A, B>(a: &mut A, b: &mut B, shutdown: &CancellationToken) -> CopyOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // Fired once, by whichever direction fails first.
    let failed = CancellationToken::new();
    let mut a_to_b = DirectionReport::default();
    let mut b_to_a = DirectionReport::default();

    let woken_by = {
        let forward = run_direction(&mut a_read, &mut b_write, &mut a_to_b, &failed);
        let backward = run_direction(&mut b_read, &mut a_write, &mut b_to_a, &failed);
        let both = async { tokio::join!(forward, backward) };

        tokio::select! {
            biased;
            _ = failed.cancelled() => CopyEnd::DirectionFailed,
            _ = shutdown.cancelled() => CopyEnd::Cancelled,
            _ = both => CopyEnd::BothFinished,
        }
    };

    // The last direction failing also completes the join.
    let end = match a_to_b.failed() || b_to_a.failed() {
        true => CopyEnd::DirectionFailed,
        false => woken_by,
    };

    log_direction("a->b", &a_to_b);
    log_direction("b->a", &b_to_a);
    debug!(%end, sent = a_to_b.bytes, received = b_to_a.bytes, "copy loop ended");

    CopyOutcome { end, a_to_b, b_to_a }
}

async fn run_direction<R, W>(reader: &mut R, writer: &mut W, report: &mut DirectionReport, failed: &CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match copy_until_eof(reader, writer, &mut report.bytes).await {
        Ok(()) => report.end = Some(DirectionEnd::Eof),
        Err(error) => {
            report.end = Some(DirectionEnd::Failed(error));
            failed.cancel();
        }
    }
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W, bytes: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let len = reader.read(&mut buffer).await?;
        if len == 0 {
            return writer.shutdown().await;
        }

        writer.write_all(&buffer[..len]).await?;
        writer.flush().await?;
        *bytes += len as u64;
    }
}

fn log_direction(direction: &str, report: &DirectionReport) {
    if let Some(DirectionEnd::Failed(error)) = &report.end {
        if is_routine_close(error) {
            debug!(direction, %error, "copy direction stopped by teardown");
        } else {
            warn!(direction, %error, "copy direction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn copies_both_ways_until_both_finish() {
        let (mut app, mut relay_a) = duplex(64);
        let (mut relay_b, mut dest) = duplex(64);
        let shutdown = CancellationToken::new();

        let relay = tokio::spawn(async move { copy_loop(&mut relay_a, &mut relay_b, &shutdown).await });

        app.write_all(b"ping").await.unwrap();
        app.shutdown().await.unwrap();
        let mut received = Vec::new();
        dest.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        dest.write_all(b"pong").await.unwrap();
        dest.shutdown().await.unwrap();
        let mut received = Vec::new();
        app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"pong");

        let outcome = relay.await.unwrap();
        assert_eq!(outcome.end, CopyEnd::BothFinished);
        assert_eq!((outcome.a_to_b.bytes, outcome.b_to_a.bytes), (4, 4));
    }

    #[tokio::test]
    async fn eof_on_one_side_does_not_stop_the_other() {
        let (mut app, mut relay_a) = duplex(COPY_BUFFER_SIZE);
        let (mut relay_b, mut dest) = duplex(COPY_BUFFER_SIZE);
        let shutdown = CancellationToken::new();

        let relay = tokio::spawn(async move { copy_loop(&mut relay_a, &mut relay_b, &shutdown).await });

        let upload = vec![0x5a; 4096];
        let writer = tokio::spawn(async move {
            app.write_all(&upload).await.unwrap();
            app.shutdown().await.unwrap();
            app
        });

        let mut received = Vec::new();
        dest.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 4096);
        let mut app = writer.await.unwrap();
        let reader = tokio::spawn(async move {
            let mut downloaded = Vec::new();
            app.read_to_end(&mut downloaded).await.unwrap();
            downloaded
        });

        // The upload is over, the download keeps streaming.
        for chunk in 0..8u8 {
            dest.write_all(&[chunk; 1000]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dest.shutdown().await.unwrap();

        let downloaded = reader.await.unwrap();
        assert_eq!(downloaded.len(), 8000);
        assert!(downloaded.ends_with(&[7u8; 1000]));

        let outcome = relay.await.unwrap();
        assert_eq!(outcome.end, CopyEnd::BothFinished);
        assert_eq!(outcome.b_to_a.bytes, 8000);
    }

    #[tokio::test]
    async fn failure_returns_without_waiting_for_the_other_direction() {
        let (app, mut relay_a) = duplex(64);
        let (mut relay_b, mut dest) = duplex(64);
        let shutdown = CancellationToken::new();

        let relay = tokio::spawn(async move { copy_loop(&mut relay_a, &mut relay_b, &shutdown).await });

        // Writes towards the application now fail, while the application never sends anything.
        drop(app);
        dest.write_all(b"data").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(outcome.end, CopyEnd::DirectionFailed);
        assert!(outcome.b_to_a.failed());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_wait() {
        let (_app, mut relay_a) = duplex(64);
        let (mut relay_b, _dest) = duplex(64);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let relay = tokio::spawn(async move { copy_loop(&mut relay_a, &mut relay_b, &token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(outcome.end, CopyEnd::Cancelled);
        assert!(!outcome.a_to_b.is_finished());
        assert!(!outcome.b_to_a.is_finished());
    }

    #[test]
    fn teardown_errors_are_routine() {
        assert!(is_routine_close(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_routine_close(&io::Error::from(io::ErrorKind::WriteZero)));
        assert!(!is_routine_close(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
