//! Byte stream providers: the transport between client and server, the local application side,
//! and the destination side.
//!
//! The relay core only ever sees [`BoxedStream`]s, produced by a [`Dialer`] or by an
//! [`accept::Listener`](crate::accept::Listener), and never inspects how they were established.

use std::{
    io::{self, Error, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::lookup_host,
};

use crate::{
    accept::Listener,
    config::{Protocol, TransportKind},
};

pub mod quic;
pub mod tcp;
pub mod udp;

/// An ordered, reliable, bidirectional byte stream that can be moved between tasks.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Opens new byte streams towards a fixed address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// An empty IPv4 [`SocketAddr`] with port 0
pub const UNSPECIFIED_SOCKADDR_V4: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// An empty IPv6 [`SocketAddr`] with port, flowinfo, and scope_id all set to 0.
pub const UNSPECIFIED_SOCKADDR_V6: SocketAddr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));

/// Gets the unspecified address of the same family as `address`, for binding sockets that will
/// talk to it.
pub const fn unspecified_for(address: &SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V4(_) => UNSPECIFIED_SOCKADDR_V4,
        SocketAddr::V6(_) => UNSPECIFIED_SOCKADDR_V6,
    }
}

/// Resolves a `host:port` string into the first socket address it maps to.
pub async fn resolve_address(address: &str) -> io::Result<SocketAddr> {
    lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{address} did not resolve to any address")))
}

/// Starts listening for local application connections.
pub async fn bind_local_listener(protocol: Protocol, address: &str) -> io::Result<Box<dyn Listener>> {
    Ok(match protocol {
        Protocol::Tcp => Box::new(tcp::TcpRelayListener::bind(address).await?),
        Protocol::Udp => Box::new(udp::UdpListener::bind(address).await?),
    })
}

/// Starts listening for transport connections from relay clients.
pub async fn bind_transport_listener(kind: TransportKind, address: &str) -> io::Result<Box<dyn Listener>> {
    Ok(match kind {
        TransportKind::Tcp => Box::new(tcp::TcpRelayListener::bind(address).await?),
        TransportKind::Quic => Box::new(quic::QuicListener::bind(address).await?),
    })
}

/// Creates the dialer that opens transport connections to the relay server.
pub async fn transport_dialer(kind: TransportKind, server_address: &str, server_name: &str) -> io::Result<Box<dyn Dialer>> {
    Ok(match kind {
        TransportKind::Tcp => Box::new(tcp::TcpDialer::new(server_address)),
        TransportKind::Quic => Box::new(quic::QuicDialer::new(server_address, server_name).await?),
    })
}

/// Creates the dialer that opens connections to the destination.
pub fn destination_dialer(protocol: Protocol, address: &str) -> Box<dyn Dialer> {
    match protocol {
        Protocol::Tcp => Box::new(tcp::TcpDialer::new(address)),
        Protocol::Udp => Box::new(udp::UdpDialer::new(address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_matches_family() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(unspecified_for(&v4), UNSPECIFIED_SOCKADDR_V4);
        assert_eq!(unspecified_for(&v6), UNSPECIFIED_SOCKADDR_V6);
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let address = resolve_address("127.0.0.1:7901").await.unwrap();
        assert_eq!(address.port(), 7901);
    }
}
