use std::{io::ErrorKind, sync::Arc};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    accept::{accept_loop, Listener},
    config::{MuxConfig, RelayMode, ServerConfig},
    error::{Error, Result},
    mux::{MuxServer, MuxStream},
    preface::{Preface, StreamRequest, StreamResponse},
    relay::open_and_relay,
    serialize::{ByteRead, ByteWrite},
    transport::{BoxedStream, Dialer},
};

/// Serves every transport connection accepted on `listener`, relaying what it carries to the
/// destination, until the listener fails or `shutdown` is cancelled.
pub async fn run_server<L>(config: &ServerConfig, listener: &mut L, destination: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()>
where
    L: Listener + ?Sized,
{
    match listener.local_addr() {
        Ok(address) => info!("Accepting transport connections on {address} in {} mode", config.mode),
        Err(error) => warn!("Could not get the listening address: {error}"),
    }

    let mode = config.mode;
    let mux = config.mux;

    accept_loop(listener, shutdown, |transport, address| {
        let destination = Arc::clone(&destination);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_transport_connection(transport, mode, mux, destination, &shutdown).await {
                warn!("Transport connection from {address} ended with error: {error}");
            }
        });
    })
    .await
}

/// Handles one transport connection: checks the client's preface, then relays the connection
/// itself or every stream of the session it carries.
pub async fn serve_transport_connection(
    mut transport: BoxedStream,
    mode: RelayMode,
    mux: MuxConfig,
    destination: Arc<dyn Dialer>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let read_result = tokio::select! {
        result = Preface::read(&mut transport) => result,
        _ = shutdown.cancelled() => return Ok(()),
    };

    let preface = match read_result {
        Ok(preface) => preface,
        Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
            info!("Transport connection closed before the handshake");
            return Ok(());
        }
        Err(error) => return Err(Error::Handshake(format!("invalid preface: {error}"))),
    };

    preface.check_compatible(mode, &mux).map_err(Error::Handshake)?;

    match mode {
        RelayMode::SingleConnection => {
            open_and_relay(transport, dial_destination(destination.as_ref()), shutdown).await?;
            Ok(())
        }
        RelayMode::Multiplexed => serve_session(MuxServer::new(transport, &mux), destination, shutdown).await,
    }
}

async fn serve_session(mut session: MuxServer, destination: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()> {
    let mut stream_count = 0usize;

    loop {
        let maybe_stream = tokio::select! {
            result = session.accept_stream() => result?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let stream = match maybe_stream {
            Some(stream) => stream,
            None if stream_count == 0 => {
                info!("Session closed by the client before any stream was opened");
                return Ok(());
            }
            None => {
                debug!("Session closed by the client after {stream_count} streams");
                return Ok(());
            }
        };

        stream_count += 1;
        let destination = Arc::clone(&destination);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_stream(stream, destination, &shutdown).await {
                warn!("Failed to relay stream: {error}");
            }
        });
    }
}

async fn serve_stream(mut stream: MuxStream, destination: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()> {
    let request = StreamRequest::read(&mut stream)
        .await
        .map_err(|error| Error::Handshake(format!("invalid stream request: {error}")))?;

    match request {
        StreamRequest::Relay => {
            // Also acknowledges the stream, the client can only have so many unacknowledged.
            StreamResponse::Accepted.write(&mut stream).await?;
            stream.flush().await?;
            open_and_relay(stream, dial_destination(destination.as_ref()), shutdown).await?;
            Ok(())
        }
    }
}

async fn dial_destination(destination: &dyn Dialer) -> Result<BoxedStream> {
    destination.dial().await.map_err(Error::DestinationDial)
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use crate::{client::open_session_stream, mux::MuxClient};

    use super::*;

    /// Counts dial attempts and hands out one end of an in-memory pipe, or fails.
    struct CountingDialer {
        dials: AtomicUsize,
        fail: bool,
    }

    impl CountingDialer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self) -> io::Result<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ErrorKind::ConnectionRefused.into());
            }

            let (near, mut far) = duplex(1024);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = far.read_to_end(&mut buf).await;
            });
            Ok(Box::new(near))
        }
    }

    #[tokio::test]
    async fn session_closed_instantly_dials_nothing() {
        let (mut client_side, server_side) = duplex(1024);
        let destination = CountingDialer::new(false);
        let mux = MuxConfig::new();

        Preface::new(RelayMode::Multiplexed, &mux).write(&mut client_side).await.unwrap();
        drop(client_side);

        let result = serve_transport_connection(Box::new(server_side), RelayMode::Multiplexed, mux, destination.clone(), &CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(destination.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connection_closed_before_preface_dials_nothing() {
        let (client_side, server_side) = duplex(1024);
        let destination = CountingDialer::new(false);
        drop(client_side);

        let result = serve_transport_connection(Box::new(server_side), RelayMode::SingleConnection, MuxConfig::new(), destination.clone(), &CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(destination.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mode_mismatch_is_refused_without_dialing() {
        let (mut client_side, server_side) = duplex(1024);
        let destination = CountingDialer::new(false);
        let mux = MuxConfig::new();

        Preface::new(RelayMode::SingleConnection, &mux).write(&mut client_side).await.unwrap();

        let result = serve_transport_connection(Box::new(server_side), RelayMode::Multiplexed, mux, destination.clone(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(destination.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_destination_dial_closes_transport_connection() {
        let (mut client_side, server_side) = duplex(1024);
        let destination = CountingDialer::new(true);
        let mux = MuxConfig::new();

        Preface::new(RelayMode::SingleConnection, &mux).write(&mut client_side).await.unwrap();
        client_side.write_all(b"payload nobody will get").await.unwrap();

        let result = serve_transport_connection(Box::new(server_side), RelayMode::SingleConnection, mux, destination.clone(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::DestinationDial(_))));
        assert_eq!(destination.dials.load(Ordering::SeqCst), 1);

        let mut received = Vec::new();
        client_side.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn every_stream_gets_its_own_destination_connection() {
        let (mut client_side, server_side) = duplex(64 * 1024);
        let destination = CountingDialer::new(false);
        let mux = MuxConfig::new();

        Preface::new(RelayMode::Multiplexed, &mux).write(&mut client_side).await.unwrap();
        let server = tokio::spawn({
            let destination = destination.clone();
            async move { serve_transport_connection(Box::new(server_side), RelayMode::Multiplexed, mux, destination, &CancellationToken::new()).await }
        });

        let session = MuxClient::new(Box::new(client_side), &mux);
        for _ in 0..3 {
            let mut stream = open_session_stream(&session).await.unwrap();
            stream.write_all(b"data").await.unwrap();
            stream.shutdown().await.unwrap();
        }

        while destination.dials.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(session);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn streams_are_acknowledged_while_the_destination_stays_silent() {
        let (mut client_side, server_side) = duplex(64 * 1024);
        let destination = CountingDialer::new(false);
        let mux = MuxConfig::new();

        Preface::new(RelayMode::Multiplexed, &mux).write(&mut client_side).await.unwrap();
        let server = tokio::spawn({
            let destination = destination.clone();
            async move { serve_transport_connection(Box::new(server_side), RelayMode::Multiplexed, mux, destination, &CancellationToken::new()).await }
        });

        // More streams than yamux lets wait for an acknowledgement at once.
        let session = MuxClient::new(Box::new(client_side), &mux);
        let mut streams = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            for _ in 0..300 {
                streams.push(open_session_stream(&session).await.unwrap());
            }

            while destination.dials.load(Ordering::SeqCst) < 300 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(streams);
        drop(session);
        assert!(server.await.unwrap().is_ok());
    }
}
