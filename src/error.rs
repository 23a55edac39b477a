//! Error types for tunnel-relay.

use std::io;

use thiserror::Error;

/// Main error type for tunnel-relay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to listen on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("transport dial failed: {0}")]
    TransportDial(io::Error),

    #[error("destination dial failed: {0}")]
    DestinationDial(io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(io::Error),

    #[error("stream identifiers exhausted, no more streams can be opened on this session")]
    StreamIdsExhausted,

    #[error("too many open streams on this session")]
    TooManyStreams,

    #[error("multiplexed session closed")]
    SessionClosed,

    #[error("multiplexing error: {0}")]
    Mux(yamux::ConnectionError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<yamux::ConnectionError> for Error {
    fn from(error: yamux::ConnectionError) -> Self {
        match error {
            yamux::ConnectionError::NoMoreStreamIds => Error::StreamIdsExhausted,
            yamux::ConnectionError::Closed => Error::SessionClosed,
            other => Error::Mux(other),
        }
    }
}

/// Result type alias for tunnel-relay operations.
pub type Result<T> = std::result::Result<T, Error>;
