//! Tracker (directory) wire framing (Section 4.1).
//!
//! `conn_type: u8=0, version: u8, nonce: u32, cmd: u8, ...`. Packets are
//! authenticated (every `ANNOUNCE` carries a signature over the
//! announced address) but not encrypted — per the spec's Non-goals, the
//! tracker protocol has no confidentiality or forward secrecy.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{read_body, take_array, take_u32, take_u64, take_u8, FrameError, Result};

/// `conn_type` byte identifying the tracker protocol on a fresh stream.
pub const CONN_TYPE_TRACKER: u8 = 0;
pub const VERSION: u8 = 1;

pub const CMD_ANNOUNCE: u8 = 0;
pub const CMD_GET_ADDRS: u8 = 1;

/// A tracker request, as written by the directory client.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerRequest {
    Announce {
        pubkey: [u8; 32],
        priority: u8,
        client_id: u32,
        addr: [u8; 32],
        /// `Ed25519_sign(privkey, addr)`.
        signature: [u8; 64],
    },
    GetAddrs {
        pubkey: [u8; 32],
    },
}

impl TrackerRequest {
    fn cmd(&self) -> u8 {
        match self {
            TrackerRequest::Announce { .. } => CMD_ANNOUNCE,
            TrackerRequest::GetAddrs { .. } => CMD_GET_ADDRS,
        }
    }
}

/// One resolved address record in a `GET_ADDRS` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerRecord {
    pub addr: [u8; 32],
    pub signature: [u8; 64],
    pub priority: u8,
    pub client_id: u32,
    pub ttl: u64,
}

/// A tracker response, matched to its request by `(nonce, cmd)`.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerResponse {
    AnnounceAck { ttl: u64 },
    GetAddrsReply { records: Vec<TrackerRecord> },
}

/// Encode a tracker request into a fresh buffer, with no I/O. Used by
/// callers holding a `mimir_types::traits::Connection` rather than a
/// `tokio::io::AsyncWrite` (the directory client manages its own byte
/// buffer over `Connection`, the same way `mimir-session` does for P2P
/// framing).
pub fn encode_request(nonce: u32, req: &TrackerRequest) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(CONN_TYPE_TRACKER);
    buf.push(VERSION);
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.push(req.cmd());
    match req {
        TrackerRequest::Announce {
            pubkey,
            priority,
            client_id,
            addr,
            signature,
        } => {
            buf.extend_from_slice(pubkey);
            buf.push(*priority);
            buf.extend_from_slice(&client_id.to_be_bytes());
            buf.extend_from_slice(addr);
            buf.extend_from_slice(signature);
        }
        TrackerRequest::GetAddrs { pubkey } => {
            buf.extend_from_slice(pubkey);
        }
    }
    buf
}

/// Encode and write a tracker request with the given `nonce`.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    nonce: u32,
    req: &TrackerRequest,
) -> Result<()> {
    writer.write_all(&encode_request(nonce, req)).await?;
    Ok(())
}

/// Attempt to parse a tracker response out of an accumulated buffer,
/// without consuming it. Returns `Ok(None)` when `buf` does not yet hold
/// a complete record (the caller should read more and retry), or
/// `Ok(Some((consumed, nonce, cmd, response)))` on success, mirroring the
/// incremental-parse shape `mimir-session` uses for P2P framing.
pub fn try_decode_response(buf: &[u8]) -> Result<Option<(usize, u32, u8, TrackerResponse)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let nonce = u32::from_be_bytes(buf[0..4].try_into().expect("checked length"));
    let cmd = buf[4];
    match cmd {
        CMD_ANNOUNCE => {
            let total = 5 + 8;
            if buf.len() < total {
                return Ok(None);
            }
            let mut body = &buf[5..total];
            let ttl = take_u64(&mut body)?;
            Ok(Some((total, nonce, cmd, TrackerResponse::AnnounceAck { ttl })))
        }
        CMD_GET_ADDRS => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let count = buf[5] as usize;
            const RECORD_LEN: usize = 32 + 64 + 1 + 4 + 8;
            let total = 6 + RECORD_LEN * count;
            if buf.len() < total {
                return Ok(None);
            }
            let mut body = &buf[6..total];
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let addr = take_array::<32>(&mut body)?;
                let signature = take_array::<64>(&mut body)?;
                let priority = take_u8(&mut body)?;
                let client_id = take_u32(&mut body)?;
                let ttl = take_u64(&mut body)?;
                records.push(TrackerRecord {
                    addr,
                    signature,
                    priority,
                    client_id,
                    ttl,
                });
            }
            Ok(Some((total, nonce, cmd, TrackerResponse::GetAddrsReply { records })))
        }
        other => Err(FrameError::UnsupportedCommand(other)),
    }
}

/// Read a tracker request from a fresh stream (tracker-server side).
/// Returns `(nonce, request)`.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u32, TrackerRequest)> {
    let mut prefix = [0u8; 7];
    reader.read_exact(&mut prefix).await?;
    if prefix[0] != CONN_TYPE_TRACKER {
        return Err(FrameError::Malformed("unexpected conn_type for tracker stream"));
    }
    let nonce = u32::from_be_bytes(prefix[2..6].try_into().expect("checked length"));
    let cmd = prefix[6];
    match cmd {
        CMD_ANNOUNCE => {
            let body = read_body(reader, 32 + 1 + 4 + 32 + 64).await?;
            let mut buf = body.as_slice();
            let pubkey = take_array::<32>(&mut buf)?;
            let priority = take_u8(&mut buf)?;
            let client_id = take_u32(&mut buf)?;
            let addr = take_array::<32>(&mut buf)?;
            let signature = take_array::<64>(&mut buf)?;
            Ok((
                nonce,
                TrackerRequest::Announce {
                    pubkey,
                    priority,
                    client_id,
                    addr,
                    signature,
                },
            ))
        }
        CMD_GET_ADDRS => {
            let body = read_body(reader, 32).await?;
            let mut buf = body.as_slice();
            let pubkey = take_array::<32>(&mut buf)?;
            Ok((nonce, TrackerRequest::GetAddrs { pubkey }))
        }
        other => Err(FrameError::UnsupportedCommand(other)),
    }
}

/// Encode and write a tracker response (tracker-server side).
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    nonce: u32,
    cmd: u8,
    resp: &TrackerResponse,
) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.push(cmd);
    match resp {
        TrackerResponse::AnnounceAck { ttl } => {
            buf.extend_from_slice(&ttl.to_be_bytes());
        }
        TrackerResponse::GetAddrsReply { records } => {
            buf.push(records.len() as u8);
            for r in records {
                buf.extend_from_slice(&r.addr);
                buf.extend_from_slice(&r.signature);
                buf.push(r.priority);
                buf.extend_from_slice(&r.client_id.to_be_bytes());
                buf.extend_from_slice(&r.ttl.to_be_bytes());
            }
        }
    }
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a tracker response matching a previously sent `nonce`/`cmd`
/// (directory-client side).
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(u32, u8, TrackerResponse)> {
    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix).await?;
    let nonce = u32::from_be_bytes(prefix[0..4].try_into().expect("checked length"));
    let cmd = prefix[4];
    match cmd {
        CMD_ANNOUNCE => {
            let body = read_body(reader, 8).await?;
            let mut buf = body.as_slice();
            let ttl = take_u64(&mut buf)?;
            Ok((nonce, cmd, TrackerResponse::AnnounceAck { ttl }))
        }
        CMD_GET_ADDRS => {
            let mut count_buf = [0u8; 1];
            reader.read_exact(&mut count_buf).await?;
            let count = count_buf[0];
            const RECORD_LEN: u64 = 32 + 64 + 1 + 4 + 8;
            let body = read_body(reader, RECORD_LEN * count as u64).await?;
            let mut buf = body.as_slice();
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let addr = take_array::<32>(&mut buf)?;
                let signature = take_array::<64>(&mut buf)?;
                let priority = take_u8(&mut buf)?;
                let client_id = take_u32(&mut buf)?;
                let ttl = take_u64(&mut buf)?;
                records.push(TrackerRecord {
                    addr,
                    signature,
                    priority,
                    client_id,
                    ttl,
                });
            }
            Ok((nonce, cmd, TrackerResponse::GetAddrsReply { records }))
        }
        other => Err(FrameError::UnsupportedCommand(other)),
    }
}
