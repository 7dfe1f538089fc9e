//! # mimir-codec
//!
//! The frame codec for all three Mimir wire protocols (Section 4.1):
//! peer-to-peer session framing ([`p2p`]), tracker/directory framing
//! ([`tracker`]), and mediator request/response/push framing
//! ([`mediator`]).
//!
//! All integers are big-endian. Every decoder takes anything implementing
//! `tokio::io::AsyncRead + Unpin` and pre-reads the full record before
//! parsing it — decoders never observe a partial record. Every encoder
//! writes into a caller-owned `Vec<u8>` that the caller then hands to a
//! `Connection::write`. Malformed input (a negative-looking length, a
//! fixed-size field of the wrong size, a non-UTF-8 string) always yields
//! [`FrameError::Malformed`], never a panic.

pub mod mediator;
pub mod p2p;
pub mod tracker;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A named field failed a length/bounds/UTF-8 check.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The underlying reader/writer failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A recognized P2P envelope carried an unrecognized `type`.
    #[error("unsupported P2P message type: {0}")]
    UnsupportedType(u32),

    /// A recognized tracker/mediator envelope carried an unrecognized
    /// command byte.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Maximum single-record body size this codec will allocate for while
/// decoding. Guards against a hostile peer claiming an enormous `size`
/// and exhausting memory before the record is proven malformed.
pub const MAX_FRAME_BODY: u64 = 64 * 1024 * 1024;

/// Read exactly `len` bytes, rejecting lengths over [`MAX_FRAME_BODY`]
/// before allocating.
pub(crate) async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    if len > MAX_FRAME_BODY {
        return Err(FrameError::Malformed("body size exceeds maximum"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read a length-prefixed (`u32` byte count) UTF-8 string.
pub(crate) fn take_string(buf: &mut &[u8]) -> Result<String> {
    let len = take_u32(buf)? as usize;
    if buf.len() < len {
        return Err(FrameError::Malformed("string length exceeds buffer"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::Malformed("invalid UTF-8 string"))
}

/// Read a length-prefixed (`u32` byte count) byte blob.
pub(crate) fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(buf)? as usize;
    if buf.len() < len {
        return Err(FrameError::Malformed("blob length exceeds buffer"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Ok(bytes.to_vec())
}

pub(crate) fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(FrameError::Malformed("expected u8, found end of buffer"));
    }
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

pub(crate) fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(FrameError::Malformed("expected u16, found end of buffer"));
    }
    let v = u16::from_be_bytes(buf[..2].try_into().expect("checked length"));
    *buf = &buf[2..];
    Ok(v)
}

pub(crate) fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(FrameError::Malformed("expected u32, found end of buffer"));
    }
    let v = u32::from_be_bytes(buf[..4].try_into().expect("checked length"));
    *buf = &buf[4..];
    Ok(v)
}

pub(crate) fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        return Err(FrameError::Malformed("expected u64, found end of buffer"));
    }
    let v = u64::from_be_bytes(buf[..8].try_into().expect("checked length"));
    *buf = &buf[8..];
    Ok(v)
}

pub(crate) fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    if buf.len() < N {
        return Err(FrameError::Malformed("expected fixed-size array, found end of buffer"));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(out)
}
