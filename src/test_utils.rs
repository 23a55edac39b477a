use std::{
    fmt::Debug,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Tracks byte streams handed to the code under test, so tests can assert every one of them was
/// closed exactly once.
pub struct CloseChecker {
    tracked: Vec<Arc<CloseTracker>>,
}

impl CloseChecker {
    pub const fn new() -> Self {
        Self { tracked: Vec::new() }
    }

    pub fn track<S, N: ToString>(&mut self, name: N, stream: S) -> Tracked<S> {
        let tracker = Arc::new(CloseTracker {
            was_closed: AtomicBool::new(false),
            name: name.to_string(),
        });

        self.tracked.push(Arc::clone(&tracker));
        Tracked { tracker, stream }
    }

    pub fn is_closed(&self, name: &str) -> bool {
        self.tracked
            .iter()
            .find(|t| t.name == name)
            .is_some_and(|t| t.was_closed.load(Ordering::Relaxed))
    }

    pub fn ensure_all_closed(&mut self) {
        for t in self.tracked.drain(..) {
            if !t.was_closed.load(Ordering::Relaxed) {
                panic!("The stream named {} wasn't closed", t.name);
            }
        }
    }
}

struct CloseTracker {
    was_closed: AtomicBool,
    name: String,
}

impl Drop for CloseChecker {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.ensure_all_closed()
        }
    }
}

/// A byte stream whose closing is recorded by a [`CloseChecker`].
pub struct Tracked<S> {
    tracker: Arc<CloseTracker>,
    pub stream: S,
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        if self.tracker.was_closed.swap(true, Ordering::Relaxed) {
            panic!("The stream named {} was closed twice", self.tracker.name);
        }
    }
}

impl<S: Debug> Debug for Tracked<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.stream, f)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
