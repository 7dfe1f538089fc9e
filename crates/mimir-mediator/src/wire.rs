//! Payload encoding for the mediator command surface (Section 4.6).
//!
//! The frame envelope (`version/cmd/req_id/len` and `status/req_id/len`)
//! lives in `mimir_codec::mediator`; this module owns the per-command
//! payload shapes, which the codec deliberately leaves unspecified.
//! Every integer is big-endian, matching the rest of the wire stack.

use mimir_types::model::PeerKey;

use crate::{MediatorError, Result};

pub const CMD_GET_NONCE: u8 = 0;
pub const CMD_AUTH: u8 = 1;
pub const CMD_CREATE_CHAT: u8 = 2;
pub const CMD_DELETE_CHAT: u8 = 3;
pub const CMD_ADD_USER: u8 = 4;
pub const CMD_DELETE_USER: u8 = 5;
pub const CMD_LEAVE_CHAT: u8 = 6;
pub const CMD_SUBSCRIBE: u8 = 7;
pub const CMD_GET_LAST_MESSAGE_ID: u8 = 8;
pub const CMD_GET_MESSAGES_SINCE: u8 = 9;
pub const CMD_SEND_MESSAGE: u8 = 10;
pub const CMD_SEND_INVITE: u8 = 11;
pub const CMD_RESPOND_TO_INVITE: u8 = 12;
pub const CMD_UPDATE_MEMBER_INFO: u8 = 13;
pub const CMD_GET_MEMBERS_INFO: u8 = 14;
pub const CMD_GET_MEMBERS: u8 = 15;
pub const CMD_PING: u8 = 16;

/// One raw message record as carried by `GET_MESSAGES_SINCE` and the
/// group-message push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireGroupMessage {
    pub chat_id: u64,
    pub server_msg_id: u64,
    pub guid: u64,
    pub author: PeerKey,
    pub timestamp: u64,
    pub blob: Vec<u8>,
}

/// One raw member-info record as carried by `GET_MEMBERS_INFO`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMemberInfo {
    pub pubkey: PeerKey,
    pub encrypted_blob: Vec<u8>,
    pub updated_at: u64,
}

/// One raw membership record as carried by `GET_MEMBERS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMember {
    pub pubkey: PeerKey,
    pub permissions: u8,
    pub online: bool,
    pub last_seen: u64,
}

pub(crate) fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(MediatorError::Malformed("expected u8, found end of buffer"));
    }
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

pub(crate) fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(MediatorError::Malformed("expected u32, found end of buffer"));
    }
    let v = u32::from_be_bytes(buf[..4].try_into().expect("checked length"));
    *buf = &buf[4..];
    Ok(v)
}

pub(crate) fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        return Err(MediatorError::Malformed("expected u64, found end of buffer"));
    }
    let v = u64::from_be_bytes(buf[..8].try_into().expect("checked length"));
    *buf = &buf[8..];
    Ok(v)
}

pub(crate) fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    if buf.len() < N {
        return Err(MediatorError::Malformed(
            "expected fixed-size array, found end of buffer",
        ));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(out)
}

pub(crate) fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(buf)? as usize;
    if buf.len() < len {
        return Err(MediatorError::Malformed("blob length exceeds buffer"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Ok(bytes.to_vec())
}

pub(crate) fn take_string(buf: &mut &[u8]) -> Result<String> {
    let bytes = take_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| MediatorError::Malformed("invalid UTF-8 string"))
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn put_string(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

pub fn encode_get_nonce(pubkey: &PeerKey) -> Vec<u8> {
    pubkey.to_vec()
}

pub fn decode_nonce(mut buf: &[u8]) -> Result<[u8; 32]> {
    take_array::<32>(&mut buf)
}

pub fn encode_auth(pubkey: &PeerKey, nonce: &[u8; 32], sig: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 32 + 64);
    out.extend_from_slice(pubkey);
    out.extend_from_slice(nonce);
    out.extend_from_slice(sig);
    out
}

pub fn encode_create_chat(
    nonce: &[u8; 32],
    counter: u32,
    sig: &[u8; 64],
    name: &str,
    description: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 4 + 64 + name.len() + description.len() + 8);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&counter.to_be_bytes());
    out.extend_from_slice(sig);
    put_string(&mut out, name);
    put_string(&mut out, description);
    out
}

pub fn decode_create_chat_reply(mut buf: &[u8]) -> Result<(u64, [u8; 32])> {
    let chat_id = take_u64(&mut buf)?;
    let shared_key = take_array::<32>(&mut buf)?;
    Ok((chat_id, shared_key))
}

pub fn encode_chat_id(chat_id: u64) -> Vec<u8> {
    chat_id.to_be_bytes().to_vec()
}

pub fn decode_u64_reply(mut buf: &[u8]) -> Result<u64> {
    take_u64(&mut buf)
}

pub fn encode_add_or_delete_user(chat_id: u64, user: &PeerKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32);
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.extend_from_slice(user);
    out
}

pub fn encode_get_messages_since(chat_id: u64, since_id: u64, limit: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.extend_from_slice(&since_id.to_be_bytes());
    out.extend_from_slice(&limit.to_be_bytes());
    out
}

pub fn decode_group_message(buf: &mut &[u8]) -> Result<WireGroupMessage> {
    let chat_id = take_u64(buf)?;
    let server_msg_id = take_u64(buf)?;
    let guid = take_u64(buf)?;
    let author = take_array::<32>(buf)?;
    let timestamp = take_u64(buf)?;
    let blob = take_bytes(buf)?;
    Ok(WireGroupMessage {
        chat_id,
        server_msg_id,
        guid,
        author,
        timestamp,
        blob,
    })
}

pub fn encode_group_message(msg: &WireGroupMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 8 + 32 + 8 + 4 + msg.blob.len());
    out.extend_from_slice(&msg.chat_id.to_be_bytes());
    out.extend_from_slice(&msg.server_msg_id.to_be_bytes());
    out.extend_from_slice(&msg.guid.to_be_bytes());
    out.extend_from_slice(&msg.author);
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    put_bytes(&mut out, &msg.blob);
    out
}

pub fn decode_messages_since_reply(mut buf: &[u8]) -> Result<Vec<WireGroupMessage>> {
    let count = take_u32(&mut buf)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(decode_group_message(&mut buf)?);
    }
    Ok(out)
}

pub fn encode_send_message(chat_id: u64, guid: u64, blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 4 + blob.len());
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.extend_from_slice(&guid.to_be_bytes());
    put_bytes(&mut out, blob);
    out
}

pub fn encode_send_invite(chat_id: u64, invitee: &PeerKey, shared_key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32 + 32);
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.extend_from_slice(invitee);
    out.extend_from_slice(shared_key);
    out
}

pub fn decode_invite_push(mut buf: &[u8]) -> Result<(u64, PeerKey, PeerKey, [u8; 32], u64)> {
    let chat_id = take_u64(&mut buf)?;
    let inviter = take_array::<32>(&mut buf)?;
    let invitee = take_array::<32>(&mut buf)?;
    let shared_key = take_array::<32>(&mut buf)?;
    let created_at = take_u64(&mut buf)?;
    Ok((chat_id, inviter, invitee, shared_key, created_at))
}

pub fn encode_respond_to_invite(chat_id: u64, accepted: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.push(if accepted { 1 } else { 0 });
    out
}

pub fn encode_update_member_info(chat_id: u64, encrypted_blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + encrypted_blob.len());
    out.extend_from_slice(&chat_id.to_be_bytes());
    put_bytes(&mut out, encrypted_blob);
    out
}

pub fn decode_member_info_request_push(mut buf: &[u8]) -> Result<(u64, u64)> {
    let chat_id = take_u64(&mut buf)?;
    let last_update = take_u64(&mut buf)?;
    Ok((chat_id, last_update))
}

pub fn encode_get_members_info(chat_id: u64, since_ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&chat_id.to_be_bytes());
    out.extend_from_slice(&since_ts.to_be_bytes());
    out
}

pub fn decode_members_info_reply(mut buf: &[u8]) -> Result<Vec<WireMemberInfo>> {
    let count = take_u32(&mut buf)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let pubkey = take_array::<32>(&mut buf)?;
        let encrypted_blob = take_bytes(&mut buf)?;
        let updated_at = take_u64(&mut buf)?;
        out.push(WireMemberInfo {
            pubkey,
            encrypted_blob,
            updated_at,
        });
    }
    Ok(out)
}

pub fn decode_members_reply(mut buf: &[u8]) -> Result<Vec<WireMember>> {
    let count = take_u32(&mut buf)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let pubkey = take_array::<32>(&mut buf)?;
        let permissions = take_u8(&mut buf)?;
        let online = take_u8(&mut buf)? != 0;
        let last_seen = take_u64(&mut buf)?;
        out.push(WireMember {
            pubkey,
            permissions,
            online,
            last_seen,
        });
    }
    Ok(out)
}
