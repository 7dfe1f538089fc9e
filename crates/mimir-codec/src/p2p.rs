//! P2P session wire framing (Section 4.1).
//!
//! Every record is prefixed by a header `(stream: u32, type: u32,
//! size: u64)`. `size` is the length of the body that follows; decoders
//! read exactly that many bytes before attempting to parse them, so a
//! caller can always skip an unrecognized `type` without losing framing
//! sync.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    read_body, take_array, take_bytes, take_string, take_u32, take_u64, FrameError, Result,
};

pub const TYPE_HELLO: u32 = 1;
pub const TYPE_CHALLENGE: u32 = 2;
pub const TYPE_CHALLENGE_ANSWER: u32 = 3;
pub const TYPE_CHALLENGE2: u32 = 4;
pub const TYPE_CHALLENGE_ANSWER2: u32 = 5;
pub const TYPE_INFO_REQUEST: u32 = 6;
pub const TYPE_INFO_RESPONSE: u32 = 7;
pub const TYPE_PING: u32 = 8;
pub const TYPE_PONG: u32 = 9;
pub const TYPE_MESSAGE_TEXT: u32 = 1000;
pub const TYPE_CALL_OFFER: u32 = 2000;
pub const TYPE_CALL_ANSWER: u32 = 2001;
pub const TYPE_CALL_HANG: u32 = 2002;
pub const TYPE_CALL_PACKET: u32 = 2003;
pub const TYPE_OK: u32 = 32767;

/// Attachment message types carried inside a [`MessageTextHeader`]'s
/// `msg_type` field (Section 4.1, Section 4.9).
pub const ATTACHMENT_IMAGE: u16 = 1;
pub const ATTACHMENT_FILE: u16 = 3;

/// The header of a decoded P2P record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream: u32,
    pub msg_type: u32,
    pub size: u64,
}

/// A decoded P2P session record.
#[derive(Clone, Debug, PartialEq)]
pub enum P2pMessage {
    Hello {
        version: u32,
        sender_pubkey: [u8; 32],
        receiver_pubkey: [u8; 32],
        client_id: u32,
        /// Present only when the sender's overlay address lives in the
        /// NATed `0x03::/8` subnet (Section 4.4).
        nat_address: Option<[u8; 32]>,
    },
    Challenge {
        nonce: [u8; 32],
    },
    ChallengeAnswer {
        signature: [u8; 64],
    },
    Challenge2 {
        nonce: [u8; 32],
    },
    ChallengeAnswer2 {
        signature: [u8; 64],
    },
    InfoRequest {
        since: u64,
    },
    InfoResponse {
        time: u64,
        nickname: String,
        info: String,
        avatar: Vec<u8>,
    },
    Ping,
    Pong,
    MessageText {
        header: MessageTextHeader,
        payload: Option<Vec<u8>>,
    },
    CallOffer(Vec<u8>),
    CallAnswer(Vec<u8>),
    CallHang(Vec<u8>),
    CallPacket(Vec<u8>),
    Ok {
        id: u64,
    },
}

/// The JSON header carried by a `MESSAGE_TEXT` record (Section 4.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageTextHeader {
    pub guid: u64,
    #[serde(rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(rename = "sendTime")]
    pub send_time: u64,
    #[serde(rename = "editTime", skip_serializing_if = "Option::is_none")]
    pub edit_time: Option<u64>,
    #[serde(rename = "type")]
    pub msg_type: u16,
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<u64>,
}

fn encode_body(msg: &P2pMessage) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match msg {
        P2pMessage::Hello {
            version,
            sender_pubkey,
            receiver_pubkey,
            client_id,
            nat_address,
        } => {
            body.extend_from_slice(&version.to_be_bytes());
            body.extend_from_slice(&32u32.to_be_bytes());
            body.extend_from_slice(sender_pubkey);
            body.extend_from_slice(&32u32.to_be_bytes());
            body.extend_from_slice(receiver_pubkey);
            body.extend_from_slice(&client_id.to_be_bytes());
            if let Some(addr) = nat_address {
                body.extend_from_slice(&32u32.to_be_bytes());
                body.extend_from_slice(addr);
            }
        }
        P2pMessage::Challenge { nonce } | P2pMessage::Challenge2 { nonce } => {
            body.extend_from_slice(&32u32.to_be_bytes());
            body.extend_from_slice(nonce);
        }
        P2pMessage::ChallengeAnswer { signature } | P2pMessage::ChallengeAnswer2 { signature } => {
            body.extend_from_slice(&64u32.to_be_bytes());
            body.extend_from_slice(signature);
        }
        P2pMessage::InfoRequest { since } => {
            body.extend_from_slice(&since.to_be_bytes());
        }
        P2pMessage::InfoResponse {
            time,
            nickname,
            info,
            avatar,
        } => {
            body.extend_from_slice(&time.to_be_bytes());
            let nick_bytes = nickname.as_bytes();
            body.extend_from_slice(&(nick_bytes.len() as u32).to_be_bytes());
            body.extend_from_slice(nick_bytes);
            let info_bytes = info.as_bytes();
            body.extend_from_slice(&(info_bytes.len() as u32).to_be_bytes());
            body.extend_from_slice(info_bytes);
            body.extend_from_slice(&(avatar.len() as u32).to_be_bytes());
            body.extend_from_slice(avatar);
        }
        P2pMessage::Ping | P2pMessage::Pong => {}
        P2pMessage::MessageText { header, payload } => {
            let mut header = header.clone();
            header.payload_size = payload.as_ref().map(|p| p.len() as u64);
            let json = serde_json::to_vec(&header)
                .map_err(|_| FrameError::Malformed("could not serialize MESSAGE_TEXT header"))?;
            body.extend_from_slice(&json);
            if let Some(payload) = payload {
                body.extend_from_slice(payload);
            }
        }
        P2pMessage::CallOffer(data)
        | P2pMessage::CallAnswer(data)
        | P2pMessage::CallHang(data)
        | P2pMessage::CallPacket(data) => {
            body.extend_from_slice(data);
        }
        P2pMessage::Ok { id } => {
            body.extend_from_slice(&id.to_be_bytes());
        }
    }
    Ok(body)
}

fn wire_type(msg: &P2pMessage) -> u32 {
    match msg {
        P2pMessage::Hello { .. } => TYPE_HELLO,
        P2pMessage::Challenge { .. } => TYPE_CHALLENGE,
        P2pMessage::ChallengeAnswer { .. } => TYPE_CHALLENGE_ANSWER,
        P2pMessage::Challenge2 { .. } => TYPE_CHALLENGE2,
        P2pMessage::ChallengeAnswer2 { .. } => TYPE_CHALLENGE_ANSWER2,
        P2pMessage::InfoRequest { .. } => TYPE_INFO_REQUEST,
        P2pMessage::InfoResponse { .. } => TYPE_INFO_RESPONSE,
        P2pMessage::Ping => TYPE_PING,
        P2pMessage::Pong => TYPE_PONG,
        P2pMessage::MessageText { .. } => TYPE_MESSAGE_TEXT,
        P2pMessage::CallOffer(_) => TYPE_CALL_OFFER,
        P2pMessage::CallAnswer(_) => TYPE_CALL_ANSWER,
        P2pMessage::CallHang(_) => TYPE_CALL_HANG,
        P2pMessage::CallPacket(_) => TYPE_CALL_PACKET,
        P2pMessage::Ok { .. } => TYPE_OK,
    }
}

/// Encode `msg` on `stream` into a fresh buffer: header followed by body.
pub fn encode(stream: u32, msg: &P2pMessage) -> Result<Vec<u8>> {
    let body = encode_body(msg)?;
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&stream.to_be_bytes());
    out.extend_from_slice(&wire_type(msg).to_be_bytes());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Write an encoded record to an async writer.
pub async fn write<W: AsyncWrite + Unpin>(writer: &mut W, stream: u32, msg: &P2pMessage) -> Result<()> {
    let buf = encode(stream, msg)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Parse a 16-byte header as read off the wire.
pub fn parse_header(hdr_buf: &[u8; 16]) -> FrameHeader {
    FrameHeader {
        stream: u32::from_be_bytes(hdr_buf[0..4].try_into().expect("checked length")),
        msg_type: u32::from_be_bytes(hdr_buf[4..8].try_into().expect("checked length")),
        size: u64::from_be_bytes(hdr_buf[8..16].try_into().expect("checked length")),
    }
}

/// Decode a record body given its header's `msg_type`. Exposed so callers
/// that cannot offer a `tokio::io::AsyncRead` (e.g. the custom
/// `Connection` collaborator trait) can drive their own buffering and
/// still reuse this codec.
pub fn decode(header: &FrameHeader, body: &[u8]) -> Result<P2pMessage> {
    decode_body(header.msg_type, body)
}

/// Read and decode one record: header, then exactly `size` body bytes.
pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(FrameHeader, P2pMessage)> {
    let mut hdr_buf = [0u8; 16];
    reader.read_exact(&mut hdr_buf).await?;
    let header = parse_header(&hdr_buf);
    let body = read_body(reader, header.size).await?;
    let msg = decode_body(header.msg_type, &body)?;
    Ok((header, msg))
}

fn decode_body(msg_type: u32, body: &[u8]) -> Result<P2pMessage> {
    let mut buf = body;
    match msg_type {
        TYPE_HELLO => {
            let version = take_u32(&mut buf)?;
            let pubkey_len = take_u32(&mut buf)?;
            if pubkey_len != 32 {
                return Err(FrameError::Malformed("HELLO pubkey_len must be 32"));
            }
            let sender_pubkey = take_array::<32>(&mut buf)?;
            let recv_len = take_u32(&mut buf)?;
            if recv_len != 32 {
                return Err(FrameError::Malformed("HELLO recv_len must be 32"));
            }
            let receiver_pubkey = take_array::<32>(&mut buf)?;
            let client_id = take_u32(&mut buf)?;
            let nat_address = if buf.is_empty() {
                None
            } else {
                let addr_len = take_u32(&mut buf)?;
                if addr_len != 32 {
                    return Err(FrameError::Malformed("HELLO addr_len must be 32"));
                }
                Some(take_array::<32>(&mut buf)?)
            };
            Ok(P2pMessage::Hello {
                version,
                sender_pubkey,
                receiver_pubkey,
                client_id,
                nat_address,
            })
        }
        TYPE_CHALLENGE | TYPE_CHALLENGE2 => {
            let len = take_u32(&mut buf)?;
            if len != 32 {
                return Err(FrameError::Malformed("CHALLENGE len must be 32"));
            }
            let nonce = take_array::<32>(&mut buf)?;
            Ok(if msg_type == TYPE_CHALLENGE {
                P2pMessage::Challenge { nonce }
            } else {
                P2pMessage::Challenge2 { nonce }
            })
        }
        TYPE_CHALLENGE_ANSWER | TYPE_CHALLENGE_ANSWER2 => {
            let len = take_u32(&mut buf)?;
            if len != 64 {
                return Err(FrameError::Malformed("CHALLENGE_ANSWER len must be 64"));
            }
            let signature = take_array::<64>(&mut buf)?;
            Ok(if msg_type == TYPE_CHALLENGE_ANSWER {
                P2pMessage::ChallengeAnswer { signature }
            } else {
                P2pMessage::ChallengeAnswer2 { signature }
            })
        }
        TYPE_INFO_REQUEST => Ok(P2pMessage::InfoRequest {
            since: take_u64(&mut buf)?,
        }),
        TYPE_INFO_RESPONSE => {
            let time = take_u64(&mut buf)?;
            let nickname = take_string(&mut buf)?;
            let info = take_string(&mut buf)?;
            let avatar = take_bytes(&mut buf)?;
            Ok(P2pMessage::InfoResponse {
                time,
                nickname,
                info,
                avatar,
            })
        }
        TYPE_PING => Ok(P2pMessage::Ping),
        TYPE_PONG => Ok(P2pMessage::Pong),
        TYPE_MESSAGE_TEXT => {
            let mut stream = serde_json::Deserializer::from_slice(body).into_iter::<MessageTextHeader>();
            let header = stream
                .next()
                .ok_or(FrameError::Malformed("MESSAGE_TEXT missing JSON header"))?
                .map_err(|_| FrameError::Malformed("MESSAGE_TEXT header is not valid JSON"))?;
            let offset = stream.byte_offset();
            let payload = if offset < body.len() {
                Some(body[offset..].to_vec())
            } else {
                None
            };
            Ok(P2pMessage::MessageText { header, payload })
        }
        TYPE_CALL_OFFER => Ok(P2pMessage::CallOffer(body.to_vec())),
        TYPE_CALL_ANSWER => Ok(P2pMessage::CallAnswer(body.to_vec())),
        TYPE_CALL_HANG => Ok(P2pMessage::CallHang(body.to_vec())),
        TYPE_CALL_PACKET => Ok(P2pMessage::CallPacket(body.to_vec())),
        TYPE_OK => Ok(P2pMessage::Ok {
            id: take_u64(&mut buf)?,
        }),
        other => Err(FrameError::UnsupportedType(other)),
    }
}

/// Encode the inner attachment payload for an `ATTACHMENT_IMAGE`/
/// `ATTACHMENT_FILE` `MESSAGE_TEXT`: `jsonSize: u32, meta_json, file_bytes`
/// (Section 4.1, Section 4.9).
pub fn encode_attachment_payload(meta_json: &[u8], file_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + meta_json.len() + file_bytes.len());
    out.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    out.extend_from_slice(meta_json);
    out.extend_from_slice(file_bytes);
    out
}

/// Split an attachment payload into `(meta_json, file_bytes)`.
pub fn decode_attachment_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = payload;
    let meta = take_bytes(&mut buf)?;
    Ok((meta, buf.to_vec()))
}
