//! Mediator session wire framing (Section 4.1).
//!
//! Bidirectional stream. Request: `version: u8=1, cmd: u8, req_id: u16,
//! len: u32, payload[len]`. Response: `status: u8, req_id: u16,
//! len: u32, payload[len]`. `status` 0=OK, 1=ERR (error payload is
//! `msg_len: u16, msg[utf8]`). A reserved `req_id` on a response marks a
//! server-initiated push rather than an answer to a pending request. The
//! client writes [`PROTOCOL_SELECTOR`] exactly once, immediately after
//! connecting.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{read_body, take_u16, FrameError, Result};

/// Written once, immediately after connecting, to select the mediator
/// protocol on a fresh multiplexed stream.
pub const PROTOCOL_SELECTOR: u8 = 0x00;

pub const VERSION: u8 = 1;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

/// Reserved `req_id` values identifying a server-initiated push rather
/// than a reply to a pending client request.
pub const PUSH_GROUP_MESSAGE: u16 = 0x32;
pub const PUSH_MESSAGE: u16 = 0x34;
pub const PUSH_INVITE: u16 = 0x41;
pub const PUSH_MEMBER_INFO_REQUEST: u16 = 0x51;

/// Whether `req_id` identifies a server push rather than a pending
/// request's reply slot.
pub fn is_push(req_id: u16) -> bool {
    matches!(
        req_id,
        PUSH_GROUP_MESSAGE | PUSH_MESSAGE | PUSH_INVITE | PUSH_MEMBER_INFO_REQUEST
    )
}

/// A mediator command byte. The full command surface (Section 4.6) is
/// owned by `mimir-mediator`; the codec only needs the wire byte.
pub type Cmd = u8;

/// A request frame written to the mediator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub cmd: Cmd,
    pub req_id: u16,
    pub payload: Vec<u8>,
}

/// A response (or push) frame read from the mediator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub req_id: u16,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Parse an `ERR` response's payload into its UTF-8 message.
    pub fn error_message(&self) -> Result<String> {
        let mut buf = self.payload.as_slice();
        take_string_u16(&mut buf)
    }
}

fn take_string_u16(buf: &mut &[u8]) -> Result<String> {
    let len = take_u16(buf)? as usize;
    if buf.len() < len {
        return Err(FrameError::Malformed("error message length exceeds buffer"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::Malformed("error message is not valid UTF-8"))
}

/// Build the `msg_len: u16, msg[utf8]` payload for an `ERR` response.
pub fn encode_error_payload(message: &str) -> Vec<u8> {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Write the one-time protocol selector byte.
pub async fn write_selector<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[PROTOCOL_SELECTOR]).await?;
    Ok(())
}

/// Build a request frame's on-wire bytes without writing them anywhere
/// (used by `mimir-mediator`, which frames over the abstract `Connection`
/// trait rather than `AsyncWrite`).
pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + req.payload.len());
    buf.push(VERSION);
    buf.push(req.cmd);
    buf.extend_from_slice(&req.req_id.to_be_bytes());
    buf.extend_from_slice(&(req.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&req.payload);
    buf
}

/// Encode and write a request frame.
pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, req: &Request) -> Result<()> {
    let buf = encode_request(req);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a request frame (mediator-server side).
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request> {
    let mut prefix = [0u8; 8];
    reader.read_exact(&mut prefix).await?;
    let version = prefix[0];
    if version != VERSION {
        return Err(FrameError::Malformed("unsupported mediator protocol version"));
    }
    let cmd = prefix[1];
    let req_id = u16::from_be_bytes(prefix[2..4].try_into().expect("checked length"));
    let len = u32::from_be_bytes(prefix[4..8].try_into().expect("checked length"));
    let payload = read_body(reader, len as u64).await?;
    Ok(Request {
        cmd,
        req_id,
        payload,
    })
}

/// Encode and write a response (or push) frame.
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, resp: &Response) -> Result<()> {
    let mut buf = Vec::with_capacity(7 + resp.payload.len());
    buf.push(resp.status);
    buf.extend_from_slice(&resp.req_id.to_be_bytes());
    buf.extend_from_slice(&(resp.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&resp.payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a response (or push) frame (mediator-client side).
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    let mut prefix = [0u8; 7];
    reader.read_exact(&mut prefix).await?;
    let status = prefix[0];
    let req_id = u16::from_be_bytes(prefix[1..3].try_into().expect("checked length"));
    let len = u32::from_be_bytes(prefix[3..7].try_into().expect("checked length"));
    let payload = read_body(reader, len as u64).await?;
    Ok(Response {
        status,
        req_id,
        payload,
    })
}

/// Try to decode a single response (or push) frame from the front of a
/// growing in-memory buffer. Returns `Ok(None)` when `buf` does not yet
/// hold a complete frame; otherwise `Ok(Some((consumed, response)))`
/// where `consumed` is the number of leading bytes the frame occupied.
pub fn try_decode_response(buf: &[u8]) -> Result<Option<(usize, Response)>> {
    if buf.len() < 7 {
        return Ok(None);
    }
    let status = buf[0];
    let req_id = u16::from_be_bytes(buf[1..3].try_into().expect("checked length"));
    let len = u32::from_be_bytes(buf[3..7].try_into().expect("checked length")) as usize;
    let total = 7 + len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[7..total].to_vec();
    Ok(Some((
        total,
        Response {
            status,
            req_id,
            payload,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("checked length")
            .block_on(fut)
    }

    #[test]
    fn request_round_trip() {
        let req = Request {
            cmd: 5,
            req_id: 1234,
            payload: b"hello mediator".to_vec(),
        };
        let mut buf = Vec::new();
        block_on(write_request(&mut buf, &req)).expect("checked length");
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = block_on(read_request(&mut cursor)).expect("checked length");
        assert_eq!(decoded, req);
    }

    #[test]
    fn response_round_trip() {
        let resp = Response {
            status: STATUS_OK,
            req_id: 999,
            payload: b"ok payload".to_vec(),
        };
        let mut buf = Vec::new();
        block_on(write_response(&mut buf, &resp)).expect("checked length");
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = block_on(read_response(&mut cursor)).expect("checked length");
        assert_eq!(decoded, resp);
        assert!(decoded.is_ok());
    }

    #[test]
    fn error_response_message_round_trip() {
        let resp = Response {
            status: STATUS_ERR,
            req_id: 1,
            payload: encode_error_payload("chat not found"),
        };
        assert_eq!(resp.error_message().expect("checked length"), "chat not found");
        assert!(!resp.is_ok());
    }

    #[test]
    fn try_decode_response_reports_incomplete_then_complete() {
        let resp = Response {
            status: STATUS_OK,
            req_id: 42,
            payload: b"hi".to_vec(),
        };
        let mut buf = Vec::new();
        buf.push(resp.status);
        buf.extend_from_slice(&resp.req_id.to_be_bytes());
        buf.extend_from_slice(&(resp.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&resp.payload);

        assert!(try_decode_response(&buf[..4]).expect("checked length").is_none());
        let (consumed, decoded) = try_decode_response(&buf)
            .expect("checked length")
            .expect("complete frame");
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, resp);
    }

    #[test]
    fn push_req_ids_are_recognized() {
        assert!(is_push(PUSH_GROUP_MESSAGE));
        assert!(is_push(PUSH_MESSAGE));
        assert!(is_push(PUSH_INVITE));
        assert!(is_push(PUSH_MEMBER_INFO_REQUEST));
        assert!(!is_push(0x01));
    }

    #[test]
    fn wrong_version_is_malformed() {
        let mut buf = vec![2u8, 0u8];
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result = block_on(read_request(&mut cursor));
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }
}
