use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::accept::Listener;

use super::{BoxedStream, Dialer};

pub struct TcpDialer {
    address: String,
}

impl TcpDialer {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(self.address.as_str()).await?;
        set_nodelay(&stream);
        Ok(Box::new(stream))
    }
}

pub struct TcpRelayListener {
    listener: TcpListener,
}

impl TcpRelayListener {
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Listener for TcpRelayListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (stream, address) = self.listener.accept().await?;
        set_nodelay(&stream);
        Ok((Box::new(stream), address))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!("Failed to disable Nagle's algorithm: {error}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dialer_reaches_listener() {
        let mut listener = TcpRelayListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let dialer = TcpDialer::new(&address.to_string());

        let (dialed, accepted) = tokio::join!(dialer.dial(), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        dialed.write_all(b"over tcp").await.unwrap();
        let mut buf = [0u8; 8];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tcp");
    }
}
