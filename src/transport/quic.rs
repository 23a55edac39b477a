//! QUIC transport: every transport connection is one bidirectional stream on its own QUIC
//! connection.
//!
//! The server presents an ephemeral self-signed certificate and the client doesn't verify it, so
//! this transport gives confidentiality against passive observers only.

use std::{
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use quinn::{ClientConfig, Connecting, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig, TransportConfig, VarInt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

use crate::accept::Listener;

use super::{resolve_address, unspecified_for, BoxedStream, Dialer};

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 1000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 4000;

/// The name the server's self-signed certificate is issued for.
pub const CERTIFICATE_SERVER_NAME: &str = "localhost";

/// How many established connections may wait for [`QuicListener::accept`].
const ACCEPT_QUEUE_CAPACITY: usize = 128;

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    transport_config
}

pub fn configure_client() -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));
    client_config
}

pub fn configure_server() -> io::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![CERTIFICATE_SERVER_NAME.into()]).map_err(Error::other)?;
    let cert_der = cert.serialize_der().map_err(Error::other)?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key).map_err(Error::other)?;
    server_config.transport_config(Arc::new(transport_config()));
    Ok(server_config)
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// A bidirectional QUIC stream, together with the connection that carries it.
///
/// Shutting down the write side finishes the send stream and waits for the peer to acknowledge
/// everything that was sent. Dropping it closes the connection.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    _connection: Connection,
}

impl QuicStream {
    fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            _connection: connection,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

pub struct QuicDialer {
    endpoint: Endpoint,
    server_address: SocketAddr,
    server_name: String,
}

impl QuicDialer {
    pub async fn new(server_address: &str, server_name: &str) -> io::Result<Self> {
        let server_address = resolve_address(server_address).await?;
        let mut endpoint = Endpoint::client(unspecified_for(&server_address))?;
        endpoint.set_default_client_config(configure_client());

        Ok(Self {
            endpoint,
            server_address,
            server_name: server_name.to_string(),
        })
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let connecting = self
            .endpoint
            .connect(self.server_address, &self.server_name)
            .map_err(|error| Error::new(ErrorKind::InvalidInput, error))?;

        let connection = connecting.await.map_err(Error::from)?;
        let (send, recv) = connection.open_bi().await.map_err(Error::from)?;
        Ok(Box::new(QuicStream::new(connection, send, recv)))
    }
}

pub struct QuicListener {
    endpoint: Endpoint,
    incoming: mpsc::Receiver<(BoxedStream, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl QuicListener {
    pub async fn bind(address: &str) -> io::Result<Self> {
        let address = resolve_address(address).await?;
        let endpoint = Endpoint::server(configure_server()?, address)?;

        let (sender, incoming) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let accept_task = tokio::spawn(accept_connections(endpoint.clone(), sender));

        Ok(Self {
            endpoint,
            incoming,
            accept_task,
        })
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| Error::new(ErrorKind::Other, "the QUIC endpoint stopped accepting connections"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }
}

/// Completes handshakes in their own tasks, so a slow peer can't hold back the others.
async fn accept_connections(endpoint: Endpoint, sender: mpsc::Sender<(BoxedStream, SocketAddr)>) {
    while let Some(connecting) = endpoint.accept().await {
        let sender = sender.clone();
        tokio::spawn(async move {
            match handle_connecting(connecting).await {
                Ok(accepted) => {
                    let _ = sender.send(accepted).await;
                }
                Err(error) => debug!("Failed to establish incoming QUIC connection: {error}"),
            }
        });
    }
}

async fn handle_connecting(connecting: Connecting) -> io::Result<(BoxedStream, SocketAddr)> {
    let connection = connecting.await.map_err(Error::from)?;
    let address = connection.remote_address();
    let (send, recv) = connection.accept_bi().await.map_err(Error::from)?;
    Ok((Box::new(QuicStream::new(connection, send, recv)), address))
}
