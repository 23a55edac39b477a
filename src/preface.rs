//! The messages exchanged before relaying starts.
//!
//! Every transport connection starts with a [`Preface`] written by the client, so the server can
//! refuse peers whose relay mode or multiplexing revision doesn't match its own instead of
//! relaying garbage. In multiplexed mode every stream additionally starts with a
//! [`StreamRequest`] byte, which makes the stream visible to the server before the application
//! sends anything, answered right away with a [`StreamResponse`] byte, which acknowledges the
//! stream to the client before the destination sends anything.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    config::{MuxConfig, RelayMode},
    serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum},
};

/// The bytes every transport connection starts with.
pub const PREFACE_MAGIC: [u8; 4] = *b"TRLY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preface {
    pub mode: RelayMode,
    pub mux_version: u8,
}

impl Preface {
    pub const fn new(mode: RelayMode, mux: &MuxConfig) -> Self {
        Self {
            mode,
            mux_version: mux.protocol_version,
        }
    }

    /// Checks that the peer's preface is compatible with the local configuration.
    pub fn check_compatible(&self, mode: RelayMode, mux: &MuxConfig) -> Result<(), String> {
        if self.mode != mode {
            return Err(format!("peer uses {} mode but this side uses {mode} mode", self.mode));
        }

        if mode == RelayMode::Multiplexed && self.mux_version != mux.protocol_version {
            return Err(format!(
                "peer speaks multiplexing protocol version {} but this side speaks version {}",
                self.mux_version, mux.protocol_version
            ));
        }

        Ok(())
    }
}

impl ByteWrite for Preface {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (PREFACE_MAGIC, self.mode.into_u8(), self.mux_version).write(writer).await
    }
}

impl ByteRead for Preface {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (magic, mode, mux_version) = <([u8; 4], u8, u8)>::read(reader).await?;
        if magic != PREFACE_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "Invalid preface magic"));
        }

        let mode = RelayMode::from_u8(mode).ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("Invalid RelayMode type byte: {mode}")))?;
        Ok(Self { mode, mux_version })
    }
}

/// The first byte the client writes on every multiplexed stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// Dial the destination and relay this stream to it.
    Relay = 0,
}

impl U8ReprEnum for StreamRequest {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Relay),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for StreamRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for StreamRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        read_u8_repr(reader, "StreamRequest").await
    }
}

/// The byte the server answers every [`StreamRequest`] with, before dialing the destination.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResponse {
    Accepted = 0,
}

impl U8ReprEnum for StreamResponse {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Accepted),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for StreamResponse {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for StreamResponse {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        read_u8_repr(reader, "StreamResponse").await
    }
}
