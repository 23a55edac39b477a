//! UDP "connections" exposed as byte streams.
//!
//! Each datagram travels through the byte stream as a big-endian `u16` length followed by the
//! payload, so datagram boundaries survive the relay. A listener hands out one
//! [`DatagramStream`] per remote peer address; datagrams from a peer whose stream isn't keeping
//! up are dropped, as they would be by a congested network.

use std::{
    collections::HashMap,
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{debug, trace};

use crate::accept::Listener;

use super::{resolve_address, unspecified_for, BoxedStream, Dialer};

/// The largest datagram payload that fits in a frame.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

const FRAME_HEADER_LEN: usize = 2;

/// How many datagrams can be queued for one peer before newer ones are dropped.
const PEER_QUEUE_CAPACITY: usize = 256;

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// Appends a datagram to `frames` as one frame.
pub fn put_frame(frames: &mut BytesMut, payload: &[u8]) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| Error::new(ErrorKind::InvalidInput, "datagram too large to frame"))?;
    frames.reserve(FRAME_HEADER_LEN + payload.len());
    frames.put_u16(len);
    frames.put_slice(payload);
    Ok(())
}

/// Returns the payload length of the first frame in `frames`, if the whole frame is there.
pub fn complete_frame_len(frames: &[u8]) -> Option<usize> {
    let header = frames.get(..FRAME_HEADER_LEN)?;
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    (frames.len() >= FRAME_HEADER_LEN + len).then_some(len)
}

enum DatagramSocket {
    /// A socket connected to a single remote address.
    Connected { socket: UdpSocket, scratch: Box<[u8]> },

    /// One peer of a listening socket shared with other peers.
    Peer {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        incoming: mpsc::Receiver<Bytes>,
        _registration: PeerRegistration,
    },
}

impl DatagramSocket {
    /// Receives one datagram and appends it to `frames` as a frame. Returns `false` if no more
    /// datagrams will arrive.
    fn poll_recv_frame(&mut self, cx: &mut Context<'_>, frames: &mut BytesMut) -> Poll<io::Result<bool>> {
        match self {
            Self::Connected { socket, scratch } => {
                let mut buf = ReadBuf::new(&mut scratch[..]);
                ready!(socket.poll_recv(cx, &mut buf))?;
                put_frame(frames, buf.filled())?;
                Poll::Ready(Ok(true))
            }
            Self::Peer { incoming, .. } => match ready!(incoming.poll_recv(cx)) {
                Some(datagram) => {
                    put_frame(frames, &datagram)?;
                    Poll::Ready(Ok(true))
                }
                None => Poll::Ready(Ok(false)),
            },
        }
    }

    fn poll_send(&self, cx: &mut Context<'_>, payload: &[u8]) -> Poll<io::Result<usize>> {
        match self {
            Self::Connected { socket, .. } => socket.poll_send(cx, payload),
            Self::Peer { socket, peer, .. } => socket.poll_send_to(cx, payload, *peer),
        }
    }
}

/// Removes a peer from its listener's routing table once its stream is gone.
struct PeerRegistration {
    peers: PeerMap,
    peer: SocketAddr,
}

impl Drop for PeerRegistration {
    fn drop(&mut self) {
        let mut peers = self.peers.lock();
        // A newer stream may have taken over the address already.
        if peers.get(&self.peer).is_some_and(|sender| sender.is_closed()) {
            peers.remove(&self.peer);
        }
    }
}

/// A byte stream carrying framed datagrams.
///
/// Reading yields received datagrams as frames. Written bytes are split into frames, and each
/// complete frame is sent as one datagram. Shutting down only flushes complete frames, UDP has no
/// notion of half-closing.
pub struct DatagramStream {
    socket: DatagramSocket,
    read_frames: BytesMut,
    write_frames: BytesMut,
}

impl DatagramStream {
    fn new(socket: DatagramSocket) -> Self {
        Self {
            socket,
            read_frames: BytesMut::new(),
            write_frames: BytesMut::new(),
        }
    }

    pub fn connected(socket: UdpSocket) -> Self {
        Self::new(DatagramSocket::Connected {
            socket,
            scratch: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    fn poll_send_frames(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(len) = complete_frame_len(&self.write_frames) {
            let payload = &self.write_frames[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            match ready!(self.socket.poll_send(cx, payload)) {
                Ok(_) => {}
                Err(error) if error.kind() == ErrorKind::ConnectionRefused => {
                    trace!("Dropping datagram refused by the remote host");
                }
                Err(error) => return Poll::Ready(Err(error)),
            }

            self.write_frames.advance(FRAME_HEADER_LEN + len);
        }

        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for DatagramStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.read_frames.is_empty() && !ready!(this.socket.poll_recv_frame(cx, &mut this.read_frames))? {
            return Poll::Ready(Ok(()));
        }

        let len = buf.remaining().min(this.read_frames.len());
        buf.put_slice(&this.read_frames.split_to(len));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        // Only a partial frame is kept between writes.
        ready!(self.poll_send_frames(cx))?;
        self.write_frames.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_send_frames(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_send_frames(cx)
    }
}

pub struct UdpDialer {
    address: String,
}

impl UdpDialer {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let address = resolve_address(&self.address).await?;
        let socket = UdpSocket::bind(unspecified_for(&address)).await?;
        socket.connect(address).await?;
        Ok(Box::new(DatagramStream::connected(socket)))
    }
}

/// Accepts a new [`DatagramStream`] for every peer address that sends a datagram to the socket.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    scratch: Box<[u8]>,
}

impl UdpListener {
    pub async fn bind(address: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(Mutex::new(HashMap::new())),
            scratch: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    /// Hands a datagram to its peer's stream. Returns the receiving end of a new stream if the
    /// peer has none.
    fn route(&self, peer: SocketAddr, datagram: Bytes) -> Option<mpsc::Receiver<Bytes>> {
        let mut peers = self.peers.lock();

        let datagram = match peers.get(&peer) {
            None => datagram,
            Some(sender) => match sender.try_send(datagram) {
                Ok(()) => return None,
                Err(TrySendError::Full(_)) => {
                    trace!("Dropping datagram for a peer that isn't keeping up");
                    return None;
                }
                Err(TrySendError::Closed(datagram)) => datagram,
            },
        };

        let (sender, incoming) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let _ = sender.try_send(datagram);
        peers.insert(peer, sender);
        Some(incoming)
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        loop {
            let (len, peer) = self.socket.recv_from(&mut self.scratch).await?;
            let datagram = Bytes::copy_from_slice(&self.scratch[..len]);

            if let Some(incoming) = self.route(peer, datagram) {
                debug!("New UDP peer {peer}");
                let registration = PeerRegistration {
                    peers: Arc::clone(&self.peers),
                    peer,
                };

                let stream = DatagramStream::new(DatagramSocket::Peer {
                    socket: Arc::clone(&self.socket),
                    peer,
                    incoming,
                    _registration: registration,
                });

                return Ok((Box::new(stream), peer));
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn read_frame(stream: &mut BoxedStream) -> Vec<u8> {
        let len = stream.read_u16().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[test]
    fn frames_are_length_prefixed() {
        let mut frames = BytesMut::new();
        put_frame(&mut frames, b"abc").unwrap();
        assert_eq!(&frames[..], b"\x00\x03abc");
        assert_eq!(complete_frame_len(&frames), Some(3));
        assert_eq!(complete_frame_len(&frames[..4]), None);
        assert_eq!(complete_frame_len(&frames[..1]), None);
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let mut frames = BytesMut::new();
        let error = put_frame(&mut frames, &vec![0u8; MAX_DATAGRAM_SIZE + 1]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn peers_get_separate_streams_and_boundaries_survive() {
        let mut listener = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        alice.send_to(b"first", address).await.unwrap();

        let (mut alice_stream, from) = listener.accept().await.unwrap();
        assert_eq!(from, alice.local_addr().unwrap());

        bob.send_to(b"bob", address).await.unwrap();
        let (mut bob_stream, from) = listener.accept().await.unwrap();
        assert_eq!(from, bob.local_addr().unwrap());

        alice.send_to(b"second", address).await.unwrap();
        // Datagrams only reach their streams while the listener is accepting.
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        assert_eq!(read_frame(&mut alice_stream).await, b"first");
        assert_eq!(read_frame(&mut alice_stream).await, b"second");
        assert_eq!(read_frame(&mut bob_stream).await, b"bob");

        // Writing a frame sends one datagram back to the peer.
        let mut frames = BytesMut::new();
        put_frame(&mut frames, b"reply").unwrap();
        alice_stream.write_all(&frames).await.unwrap();
        alice_stream.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = alice.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"reply");
        accept_task.abort();
    }

    #[tokio::test]
    async fn dialed_stream_sends_one_datagram_per_frame() {
        let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dialer = UdpDialer::new(&destination.local_addr().unwrap().to_string());
        let mut stream = dialer.dial().await.unwrap();

        let mut frames = BytesMut::new();
        put_frame(&mut frames, b"one").unwrap();
        put_frame(&mut frames, b"two").unwrap();
        // Split in the middle of a frame, like a byte stream may deliver it.
        stream.write_all(&frames[..4]).await.unwrap();
        stream.flush().await.unwrap();
        stream.write_all(&frames[4..]).await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = destination.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"one");
        let (len, _) = destination.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"two");

        destination.send_to(b"back", from).await.unwrap();
        assert_eq!(read_frame(&mut stream).await, b"back");
    }
}
