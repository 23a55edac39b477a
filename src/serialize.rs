//! Defines the [`ByteRead`] and [`ByteWrite`] traits, used for the small handshake messages that
//! are exchanged before any relayed bytes.
//!
//! Only the primitives the handshake needs are implemented: [`u8`], fixed-size byte arrays and
//! triples. Enums that fit in a byte implement [`U8ReprEnum`] and
//! serialize through their `u8` representation.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serializes a type into bytes, writing it to an [`AsyncWrite`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Serializes this instance into bytes, writing those bytes into a writer.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were written.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, reading it from an [`AsyncRead`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Deserializes bytes into an instance of this type by reading bytes from a reader.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were read.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}

/// Allows a type to be converted into or parsed from an [`u8`] representation.
pub trait U8ReprEnum: Sized + Copy {
    /// Parses an `u8` into the enum variant it represents, or `None` if no variant matches.
    fn from_u8(value: u8) -> Option<Self>;

    /// Converts this enum into its `u8` representation.
    fn into_u8(self) -> u8;
}

/// Reads a byte and parses it as a [`U8ReprEnum`], failing with [`ErrorKind::InvalidData`] if the
/// byte doesn't represent any variant.
pub async fn read_u8_repr<T: U8ReprEnum, R: AsyncRead + Unpin + ?Sized>(reader: &mut R, type_name: &str) -> io::Result<T> {
    let value = reader.read_u8().await?;
    T::from_u8(value).ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("Invalid {type_name} type byte: {value}")))
}

impl ByteWrite for u8 {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(*self).await
    }
}

impl ByteRead for u8 {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        reader.read_u8().await
    }
}

impl<const N: usize> ByteWrite for [u8; N] {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self).await
    }
}

impl<const N: usize> ByteRead for [u8; N] {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; N];
        reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

impl<T0: ByteWrite, T1: ByteWrite, T2: ByteWrite> ByteWrite for (T0, T1, T2) {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.0.write(writer).await?;
        self.1.write(writer).await?;
        self.2.write(writer).await
    }
}

impl<T0: ByteRead, T1: ByteRead, T2: ByteRead> ByteRead for (T0, T1, T2) {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok((T0::read(reader).await?, T1::read(reader).await?, T2::read(reader).await?))
    }
}
