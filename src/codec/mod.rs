//! Wire framing.
//!
//! Two framings share this module and are deliberately *not* compatible with each other:
//!
//! - The **numeric protocol** sends a native byte order `i32` element count followed by that many
//!   raw IEEE-754 doubles, also in native byte order. Replies carry no length prefix: the client
//!   infers the size from its own request.
//! - The **session protocol** sends opaque blobs behind a network byte order `u32` length prefix
//!   (see [`send_frame()`] and [`recv_frame()`]).
//!
//! In both cases the declared length must be exactly matched by the bytes that follow. A stream
//! that ends early yields [`FrameError::ShortRead`], never a truncated payload.

mod traits;

pub use self::traits::{FromBytes, ToBytes};

use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The size of a length or count field.
pub const LENGTH_FIELD: usize = 4;

/// The size of an encoded double.
pub const F64_FIELD: usize = 8;

/// The default upper bound for a declared length.
pub const DEFAULT_MAX_LEN: u32 = 10_000_000;

/// The byte order of the fixed-width fields of a framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// The byte order of the host, used by the numeric protocol.
    Native,
    /// Big endian, used by the session protocol.
    Network,
}

impl ByteOrder {
    pub fn decode_u32(self, bytes: [u8; LENGTH_FIELD]) -> u32 {
        match self {
            ByteOrder::Native => u32::from_ne_bytes(bytes),
            ByteOrder::Network => u32::from_be_bytes(bytes),
        }
    }

    pub fn encode_u32(self, value: u32) -> [u8; LENGTH_FIELD] {
        match self {
            ByteOrder::Native => value.to_ne_bytes(),
            ByteOrder::Network => value.to_be_bytes(),
        }
    }
}

/// An error raised while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly before the first byte of a frame.
    #[error("peer disconnected")]
    Disconnected,
    /// The peer closed the stream in the middle of a frame.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    /// The declared length failed the sanity bound.
    #[error("declared length {length} is out of range 1..={max}")]
    SizeOutOfRange { length: i64, max: u32 },
    /// The payload could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the peer went away, as opposed to sending something invalid.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FrameError::Disconnected | FrameError::ShortRead { .. }
        )
    }
}

/// Reads until `buf` is full or the stream ends and returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Fills `buf` completely.
///
/// With `at_boundary` set, an end of stream before the first byte is reported as
/// [`FrameError::Disconnected`].
async fn fill<R>(reader: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let actual = read_full(reader, buf).await?;
    if actual == buf.len() {
        Ok(())
    } else if actual == 0 && at_boundary {
        Err(FrameError::Disconnected)
    } else {
        Err(FrameError::ShortRead {
            expected: buf.len(),
            actual,
        })
    }
}

/// Reads a length field and checks it against `1..=max`.
///
/// The field is interpreted as a signed 32 bits integer, so that a negative count written by a
/// peer is rejected rather than read as a huge length. `at_boundary` tells whether this field
/// opens a new frame.
pub async fn read_length<R>(
    reader: &mut R,
    order: ByteOrder,
    max: u32,
    at_boundary: bool,
) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut field = [0_u8; LENGTH_FIELD];
    fill(reader, &mut field, at_boundary).await?;
    let length = i64::from(order.decode_u32(field) as i32);
    if length <= 0 || length > i64::from(max) {
        return Err(FrameError::SizeOutOfRange { length, max });
    }
    Ok(length as usize)
}

/// Writes a length field.
pub async fn write_length<W>(writer: &mut W, order: ByteOrder, length: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let field = encode_length(order, length)?;
    writer.write_all(&field).await?;
    Ok(())
}

/// Encodes a length field, which must fit a signed 32 bits integer.
pub fn encode_length(order: ByteOrder, length: usize) -> Result<[u8; LENGTH_FIELD], FrameError> {
    if length > i32::MAX as usize {
        return Err(FrameError::SizeOutOfRange {
            length: length as i64,
            max: i32::MAX as u32,
        });
    }
    Ok(order.encode_u32(length as u32))
}

/// The most payload bytes reserved before they have arrived.
const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Reads exactly `length` payload bytes.
///
/// The buffer grows with the bytes actually received, so a declared length alone never reserves
/// more than [`PAYLOAD_CHUNK`] bytes.
pub async fn read_payload<R>(reader: &mut R, length: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut payload = Vec::with_capacity(length.min(PAYLOAD_CHUNK));
    (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut payload)
        .await?;
    if payload.len() < length {
        return Err(FrameError::ShortRead {
            expected: length,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Sends `payload` as one length-prefixed frame and flushes the writer.
pub async fn send_frame<W>(writer: &mut W, order: ByteOrder, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut message = Vec::with_capacity(LENGTH_FIELD + payload.len());
    message.extend_from_slice(&encode_length(order, payload.len())?);
    message.extend_from_slice(payload);
    writer.write_all(&message).await?;
    writer.flush().await?;
    Ok(())
}

/// Receives one length-prefixed frame whose declared length must lie in `1..=max`.
pub async fn recv_frame<R>(reader: &mut R, order: ByteOrder, max: u32) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = read_length(reader, order, max, true).await?;
    let payload = read_payload(reader, length).await?;
    Ok(Bytes::from(payload))
}

/// Reads `count` native byte order doubles.
pub async fn read_doubles<R>(reader: &mut R, count: usize) -> Result<Vec<f64>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_payload(reader, count * F64_FIELD).await?;
    Ok(decode_doubles(&bytes))
}

/// Writes `values` as native byte order doubles, without any length prefix, and flushes.
pub async fn write_doubles<W>(writer: &mut W, values: &[f64]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_doubles(values)).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode_doubles(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_ne_bytes()).collect()
}

/// Decodes native byte order doubles. Trailing bytes that do not form a whole double are ignored.
pub fn decode_doubles(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(F64_FIELD)
        .map(|chunk| {
            let mut field = [0_u8; F64_FIELD];
            field.copy_from_slice(chunk);
            f64::from_ne_bytes(field)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_network_order() {
        let mut sent = Vec::new();
        send_frame(&mut sent, ByteOrder::Network, b"hello").await.unwrap();
        assert_eq!(sent, [&[0, 0, 0, 5][..], b"hello"].concat());

        let frame = recv_frame(&mut sent.as_slice(), ByteOrder::Network, DEFAULT_MAX_LEN)
            .await
            .unwrap();
        assert_eq!(frame.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_frame_native_order() {
        let mut sent = Vec::new();
        send_frame(&mut sent, ByteOrder::Native, &[7, 8]).await.unwrap();
        assert_eq!(&sent[..LENGTH_FIELD], &2_u32.to_ne_bytes());
    }

    #[tokio::test]
    async fn test_short_payload() {
        let mut bytes = 10_u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let err = recv_frame(&mut bytes.as_slice(), ByteOrder::Network, DEFAULT_MAX_LEN)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::ShortRead {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_huge_declared_payload() {
        let length = isize::MAX as usize;
        let err = read_payload(&mut &[1_u8, 2, 3][..], length)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::ShortRead { expected, actual: 3 } if expected == length
        ));
    }

    #[tokio::test]
    async fn test_short_length_field() {
        let err = recv_frame(&mut &[0_u8, 0][..], ByteOrder::Network, DEFAULT_MAX_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::ShortRead { expected: 4, actual: 2 }));
    }

    #[tokio::test]
    async fn test_disconnect_at_boundary() {
        let err = recv_frame(&mut &b""[..], ByteOrder::Network, DEFAULT_MAX_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Disconnected));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_size_out_of_range() {
        for length in &[0_i32, -1, 10_000_001] {
            let bytes = length.to_be_bytes();
            let err = recv_frame(&mut &bytes[..], ByteOrder::Network, DEFAULT_MAX_LEN)
                .await
                .unwrap_err();
            match err {
                FrameError::SizeOutOfRange { length: got, max } => {
                    assert_eq!(got, i64::from(*length));
                    assert_eq!(max, DEFAULT_MAX_LEN);
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&3_u32.to_be_bytes())
            .read(&[1])
            .read(&[2, 3])
            .build();
        let frame = recv_frame(&mut mock, ByteOrder::Network, DEFAULT_MAX_LEN)
            .await
            .unwrap();
        assert_eq!(frame.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_doubles() {
        let mut sent = Vec::new();
        write_doubles(&mut sent, &[1.5, -2.0]).await.unwrap();
        assert_eq!(sent.len(), 2 * F64_FIELD);

        let values = read_doubles(&mut sent.as_slice(), 2).await.unwrap();
        assert_eq!(values, vec![1.5, -2.0]);

        let err = read_doubles(&mut &sent[..12], 2).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead { expected: 16, actual: 12 }));
    }
}
