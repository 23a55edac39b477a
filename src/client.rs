use std::{net::SocketAddr, sync::Arc};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    accept::{accept_loop, Listener},
    config::{ClientConfig, RelayMode},
    error::{Error, Result},
    mux::{MuxClient, MuxStream},
    preface::{Preface, StreamRequest, StreamResponse},
    relay::open_and_relay,
    serialize::{ByteRead, ByteWrite},
    transport::{BoxedStream, Dialer},
};

/// Relays every connection accepted on `listener` to the server, until the listener fails or
/// `shutdown` is cancelled.
///
/// In multiplexed mode the transport connection is established once, up front, and a failure to
/// do so is returned. If that session closes afterwards, no more connections can be relayed and
/// [`Error::SessionClosed`] is returned.
pub async fn run_client<L>(config: &ClientConfig, listener: &mut L, transport: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()>
where
    L: Listener + ?Sized,
{
    match listener.local_addr() {
        Ok(address) => info!("Relaying {} connections from {address} in {} mode", config.protocol, config.mode),
        Err(error) => warn!("Could not get the listening address: {error}"),
    }

    match config.mode {
        RelayMode::SingleConnection => run_single_connection(config, listener, transport, shutdown).await,
        RelayMode::Multiplexed => run_multiplexed(config, listener, transport, shutdown).await,
    }
}

async fn run_single_connection<L>(config: &ClientConfig, listener: &mut L, transport: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()>
where
    L: Listener + ?Sized,
{
    let preface = Preface::new(RelayMode::SingleConnection, &config.mux);

    accept_loop(listener, shutdown, |local, address| {
        let transport = Arc::clone(&transport);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = open_and_relay(local, open_transport(transport.as_ref(), preface), &shutdown).await;
            log_relay_result(result, address);
        });
    })
    .await
}

async fn run_multiplexed<L>(config: &ClientConfig, listener: &mut L, transport: Arc<dyn Dialer>, shutdown: &CancellationToken) -> Result<()>
where
    L: Listener + ?Sized,
{
    let preface = Preface::new(RelayMode::Multiplexed, &config.mux);
    let transport_stream = tokio::select! {
        result = open_transport(transport.as_ref(), preface) => result?,
        _ = shutdown.cancelled() => return Ok(()),
    };

    let session = MuxClient::new(transport_stream, &config.mux);
    info!("Multiplexed session established");

    let dispatch = |local: BoxedStream, address: SocketAddr| {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = open_and_relay(local, open_session_stream(&session), &shutdown).await;
            log_relay_result(result, address);
        });
    };

    tokio::select! {
        result = accept_loop(listener, shutdown, dispatch) => result,
        _ = session.closed() => {
            error!("The multiplexed session closed, no more connections can be relayed");
            Err(Error::SessionClosed)
        }
    }
}

/// Establishes a transport connection and introduces this client on it.
async fn open_transport(transport: &dyn Dialer, preface: Preface) -> Result<BoxedStream> {
    let mut stream = transport.dial().await.map_err(Error::TransportDial)?;
    preface.write(&mut stream).await?;
    stream.flush().await?;
    Ok(stream)
}

/// Opens a stream on the session and waits for the server to take it.
pub(crate) async fn open_session_stream(session: &MuxClient) -> Result<MuxStream> {
    let mut stream = session.open_stream().await?;
    StreamRequest::Relay.write(&mut stream).await?;
    stream.flush().await?;

    match StreamResponse::read(&mut stream).await {
        Ok(StreamResponse::Accepted) => Ok(stream),
        Err(error) => Err(Error::Handshake(format!("stream not accepted by the server: {error}"))),
    }
}

fn log_relay_result<T>(result: Result<T>, address: SocketAddr) {
    match result {
        Ok(_) => {}
        Err(error @ Error::StreamIdsExhausted) => error!("Dropping connection from {address}: {error}"),
        Err(error) => warn!("Dropping connection from {address}: {error}"),
    }
}
