//! Hosted-channel wire protocol
//!
//! This module implements the hosted-channel message set and its framing:
//! `tag (u16 BE) || length (u16 BE) || payload`, with tag numbers from
//! bLIP-0017 and BOLT-2 shapes for the shared HTLC update messages. All
//! field codecs are byte-exact big-endian; nothing here is stateful.

use crate::lcss::LastCrossSignedState;
use crate::types::{hex_serde, ChannelId, PaymentHash, PaymentPreimage, ShortChannelId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error types for wire protocol operations
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unknown message tag: {0}")]
    UnknownTag(u16),

    #[error("Truncated message")]
    Truncated,

    #[error("Frame length mismatch: declared {declared}, got {actual}")]
    BadFrameLength { declared: usize, actual: usize },

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

// bLIP-0017 message tags
pub const TAG_INVOKE_HOSTED_CHANNEL: u16 = 65535;
pub const TAG_INIT_HOSTED_CHANNEL: u16 = 65533;
pub const TAG_LAST_CROSS_SIGNED_STATE: u16 = 65531;
pub const TAG_STATE_UPDATE: u16 = 65529;
pub const TAG_STATE_OVERRIDE: u16 = 65527;
pub const TAG_HOSTED_CHANNEL_BRANDING: u16 = 65525;
pub const TAG_ASK_BRANDING_INFO: u16 = 65511;
pub const TAG_UPDATE_ADD_HTLC: u16 = 63505;
pub const TAG_UPDATE_FULFILL_HTLC: u16 = 63503;
pub const TAG_UPDATE_FAIL_HTLC: u16 = 63501;
pub const TAG_UPDATE_FAIL_MALFORMED_HTLC: u16 = 63499;
pub const TAG_ERROR: u16 = 63497;
pub const TAG_CHANNEL_UPDATE: u16 = 63495;

// Four-digit ASCII protocol error codes carried in signed Error messages
pub const ERR_HOSTED_WRONG_BLOCKDAY: &str = "0001";
pub const ERR_HOSTED_WRONG_LOCAL_SIG: &str = "0002";
pub const ERR_HOSTED_WRONG_REMOTE_SIG: &str = "0003";
pub const ERR_HOSTED_CLOSED_BY_REMOTE_PEER: &str = "0004";
pub const ERR_HOSTED_TIMED_OUT_OUTGOING_HTLC: &str = "0005";
pub const ERR_HOSTED_CHANNEL_DENIED: &str = "0007";
pub const ERR_HOSTED_MANUAL_SUSPEND: &str = "0008";

/// 64-byte compact ECDSA signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature64(pub [u8; 64]);

impl Signature64 {
    pub const ZERO: Signature64 = Signature64([0u8; 64]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for Signature64 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Signature64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature64({})", hex::encode(self.0))
    }
}

impl Serialize for Signature64 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature64 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("expected 64 bytes"));
        }
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&bytes);
        Ok(Self(sig))
    }
}

/// Byte writer for the big-endian wire format
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// u16 length prefix followed by the bytes
    pub fn put_var_bytes(&mut self, v: &[u8]) {
        self.put_u16(v.len() as u16);
        self.put_bytes(v);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Byte reader for the big-endian wire format
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn array32(&mut self) -> Result<[u8; 32], WireError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn array64(&mut self) -> Result<[u8; 64], WireError> {
        let b = self.take(64)?;
        let mut out = [0u8; 64];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn var_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }
}

/// Invocation of a hosted channel by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeHostedChannel {
    /// Genesis hash of the chain both sides must agree on
    pub chain_hash: [u8; 32],

    /// Client's refund script, paid on a future on-chain settlement
    pub refund_script_pub_key: Vec<u8>,

    /// Optional invocation secret gating channel creation
    pub secret: Vec<u8>,
}

/// Static channel parameters advertised by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitHostedChannel {
    pub max_htlc_value_in_flight_msat: u64,
    pub htlc_minimum_msat: u64,
    pub max_accepted_htlcs: u16,
    pub channel_capacity_msat: u64,
    pub initial_client_balance_msat: u64,
}

/// Signature exchange driving every state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub block_day: u32,
    pub local_updates: u32,
    pub remote_updates: u32,
    pub local_sig_of_remote_lcss: Signature64,
}

/// Host proposal to reset an errored channel to fresh balances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateOverride {
    pub block_day: u32,
    pub local_balance_msat: u64,
    pub local_updates: u32,
    pub remote_updates: u32,
    pub local_sig_of_remote_lcss: Signature64,
}

/// Channel-fatal error notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub channel_id: ChannelId,

    #[serde(with = "hex_serde")]
    pub data: Vec<u8>,
}

impl ErrorMessage {
    /// Build an error carrying a four-digit code and a readable reason
    pub fn coded(channel_id: ChannelId, code: &str, reason: &str) -> Self {
        let mut data = code.as_bytes().to_vec();
        if !reason.is_empty() {
            data.push(b' ');
            data.extend_from_slice(reason.as_bytes());
        }
        Self { channel_id, data }
    }

    /// The leading four-digit code, if the data carries one
    pub fn code(&self) -> Option<&str> {
        if self.data.len() < 4 {
            return None;
        }
        let head = std::str::from_utf8(&self.data[..4]).ok()?;
        head.bytes().all(|b| b.is_ascii_digit()).then_some(head)
    }

    /// Human-readable rendering of the error payload
    pub fn description(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Client request for host branding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AskBrandingInfo {
    pub chain_hash: [u8; 32],
}

/// Host branding served to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedChannelBranding {
    pub rgb: [u8; 3],
    pub png_icon: Option<Vec<u8>>,
    pub contact_info: String,
}

/// Gossip-style channel parameters announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub signature: Signature64,
    pub chain_hash: [u8; 32],
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: u8,
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
}

/// Offer of a new HTLC (BOLT-2 shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,

    #[serde(with = "hex_serde")]
    pub onion_routing_packet: Vec<u8>,
}

/// Settlement of an HTLC by revealing its preimage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub payment_preimage: PaymentPreimage,
}

/// Failure of an HTLC with an encrypted reason onion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub reason: Vec<u8>,
}

/// Failure of an HTLC whose onion could not be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub sha256_of_onion: [u8; 32],
    pub failure_code: u16,
}

/// All hosted-channel messages exchanged with a peer
#[derive(Debug, Clone, PartialEq)]
pub enum HostedMessage {
    Invoke(InvokeHostedChannel),
    Init(InitHostedChannel),
    LastCrossSignedState(Box<LastCrossSignedState>),
    StateUpdate(StateUpdate),
    StateOverride(StateOverride),
    Branding(HostedChannelBranding),
    AskBrandingInfo(AskBrandingInfo),
    AddHtlc(UpdateAddHtlc),
    FulfillHtlc(UpdateFulfillHtlc),
    FailHtlc(UpdateFailHtlc),
    FailMalformedHtlc(UpdateFailMalformedHtlc),
    Error(ErrorMessage),
    ChannelUpdate(ChannelUpdate),
}

impl HostedMessage {
    pub fn tag(&self) -> u16 {
        match self {
            HostedMessage::Invoke(_) => TAG_INVOKE_HOSTED_CHANNEL,
            HostedMessage::Init(_) => TAG_INIT_HOSTED_CHANNEL,
            HostedMessage::LastCrossSignedState(_) => TAG_LAST_CROSS_SIGNED_STATE,
            HostedMessage::StateUpdate(_) => TAG_STATE_UPDATE,
            HostedMessage::StateOverride(_) => TAG_STATE_OVERRIDE,
            HostedMessage::Branding(_) => TAG_HOSTED_CHANNEL_BRANDING,
            HostedMessage::AskBrandingInfo(_) => TAG_ASK_BRANDING_INFO,
            HostedMessage::AddHtlc(_) => TAG_UPDATE_ADD_HTLC,
            HostedMessage::FulfillHtlc(_) => TAG_UPDATE_FULFILL_HTLC,
            HostedMessage::FailHtlc(_) => TAG_UPDATE_FAIL_HTLC,
            HostedMessage::FailMalformedHtlc(_) => TAG_UPDATE_FAIL_MALFORMED_HTLC,
            HostedMessage::Error(_) => TAG_ERROR,
            HostedMessage::ChannelUpdate(_) => TAG_CHANNEL_UPDATE,
        }
    }

    /// Encode the payload without framing
    fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            HostedMessage::Invoke(m) => {
                w.put_bytes(&m.chain_hash);
                w.put_var_bytes(&m.refund_script_pub_key);
                w.put_var_bytes(&m.secret);
            }
            HostedMessage::Init(m) => {
                encode_init(&mut w, m);
            }
            HostedMessage::LastCrossSignedState(m) => {
                m.encode(&mut w);
            }
            HostedMessage::StateUpdate(m) => {
                w.put_u32(m.block_day);
                w.put_u32(m.local_updates);
                w.put_u32(m.remote_updates);
                w.put_bytes(&m.local_sig_of_remote_lcss.0);
            }
            HostedMessage::StateOverride(m) => {
                w.put_u32(m.block_day);
                w.put_u64(m.local_balance_msat);
                w.put_u32(m.local_updates);
                w.put_u32(m.remote_updates);
                w.put_bytes(&m.local_sig_of_remote_lcss.0);
            }
            HostedMessage::Branding(m) => {
                w.put_bytes(&m.rgb);
                w.put_var_bytes(m.png_icon.as_deref().unwrap_or(&[]));
                w.put_var_bytes(m.contact_info.as_bytes());
            }
            HostedMessage::AskBrandingInfo(m) => {
                w.put_bytes(&m.chain_hash);
            }
            HostedMessage::AddHtlc(m) => {
                encode_add_htlc(&mut w, m);
            }
            HostedMessage::FulfillHtlc(m) => {
                w.put_bytes(m.channel_id.as_bytes());
                w.put_u64(m.id);
                w.put_bytes(m.payment_preimage.as_bytes());
            }
            HostedMessage::FailHtlc(m) => {
                w.put_bytes(m.channel_id.as_bytes());
                w.put_u64(m.id);
                w.put_var_bytes(&m.reason);
            }
            HostedMessage::FailMalformedHtlc(m) => {
                w.put_bytes(m.channel_id.as_bytes());
                w.put_u64(m.id);
                w.put_bytes(&m.sha256_of_onion);
                w.put_u16(m.failure_code);
            }
            HostedMessage::Error(m) => {
                w.put_bytes(m.channel_id.as_bytes());
                w.put_var_bytes(&m.data);
            }
            HostedMessage::ChannelUpdate(m) => {
                w.put_bytes(&m.signature.0);
                w.put_bytes(&m.chain_hash);
                w.put_u64(m.short_channel_id.0);
                w.put_u32(m.timestamp);
                w.put_u8(m.message_flags);
                w.put_u8(m.channel_flags);
                w.put_u16(m.cltv_expiry_delta);
                w.put_u64(m.htlc_minimum_msat);
                w.put_u32(m.fee_base_msat);
                w.put_u32(m.fee_proportional_millionths);
                w.put_u64(m.htlc_maximum_msat);
            }
        }
        w.into_vec()
    }

    /// Frame the message as `tag || length || payload`
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut w = Writer::new();
        w.put_u16(self.tag());
        w.put_u16(payload.len() as u16);
        w.put_bytes(&payload);
        w.into_vec()
    }

    /// Parse one framed message
    pub fn decode_frame(frame: &[u8]) -> Result<HostedMessage, WireError> {
        let mut r = Reader::new(frame);
        let tag = r.u16()?;
        let declared = r.u16()? as usize;
        let payload = r.remaining();
        if payload.len() != declared {
            return Err(WireError::BadFrameLength {
                declared,
                actual: payload.len(),
            });
        }
        Self::decode_payload(tag, &payload)
    }

    fn decode_payload(tag: u16, payload: &[u8]) -> Result<HostedMessage, WireError> {
        let mut r = Reader::new(payload);
        let msg = match tag {
            TAG_INVOKE_HOSTED_CHANNEL => HostedMessage::Invoke(InvokeHostedChannel {
                chain_hash: r.array32()?,
                refund_script_pub_key: r.var_bytes()?,
                secret: r.var_bytes()?,
            }),
            TAG_INIT_HOSTED_CHANNEL => HostedMessage::Init(decode_init(&mut r)?),
            TAG_LAST_CROSS_SIGNED_STATE => HostedMessage::LastCrossSignedState(Box::new(
                LastCrossSignedState::decode(&mut r)?,
            )),
            TAG_STATE_UPDATE => HostedMessage::StateUpdate(StateUpdate {
                block_day: r.u32()?,
                local_updates: r.u32()?,
                remote_updates: r.u32()?,
                local_sig_of_remote_lcss: Signature64(r.array64()?),
            }),
            TAG_STATE_OVERRIDE => HostedMessage::StateOverride(StateOverride {
                block_day: r.u32()?,
                local_balance_msat: r.u64()?,
                local_updates: r.u32()?,
                remote_updates: r.u32()?,
                local_sig_of_remote_lcss: Signature64(r.array64()?),
            }),
            TAG_HOSTED_CHANNEL_BRANDING => {
                let rgb_bytes = r.take(3)?;
                let rgb = [rgb_bytes[0], rgb_bytes[1], rgb_bytes[2]];
                let png = r.var_bytes()?;
                let contact = r.var_bytes()?;
                HostedMessage::Branding(HostedChannelBranding {
                    rgb,
                    png_icon: (!png.is_empty()).then_some(png),
                    contact_info: String::from_utf8_lossy(&contact).into_owned(),
                })
            }
            TAG_ASK_BRANDING_INFO => HostedMessage::AskBrandingInfo(AskBrandingInfo {
                chain_hash: r.array32()?,
            }),
            TAG_UPDATE_ADD_HTLC => HostedMessage::AddHtlc(decode_add_htlc(&mut r)?),
            TAG_UPDATE_FULFILL_HTLC => HostedMessage::FulfillHtlc(UpdateFulfillHtlc {
                channel_id: ChannelId(r.array32()?),
                id: r.u64()?,
                payment_preimage: PaymentPreimage(r.array32()?),
            }),
            TAG_UPDATE_FAIL_HTLC => HostedMessage::FailHtlc(UpdateFailHtlc {
                channel_id: ChannelId(r.array32()?),
                id: r.u64()?,
                reason: r.var_bytes()?,
            }),
            TAG_UPDATE_FAIL_MALFORMED_HTLC => {
                HostedMessage::FailMalformedHtlc(UpdateFailMalformedHtlc {
                    channel_id: ChannelId(r.array32()?),
                    id: r.u64()?,
                    sha256_of_onion: r.array32()?,
                    failure_code: r.u16()?,
                })
            }
            TAG_ERROR => HostedMessage::Error(ErrorMessage {
                channel_id: ChannelId(r.array32()?),
                data: r.var_bytes()?,
            }),
            TAG_CHANNEL_UPDATE => HostedMessage::ChannelUpdate(ChannelUpdate {
                signature: Signature64(r.array64()?),
                chain_hash: r.array32()?,
                short_channel_id: ShortChannelId(r.u64()?),
                timestamp: r.u32()?,
                message_flags: r.u8()?,
                channel_flags: r.u8()?,
                cltv_expiry_delta: r.u16()?,
                htlc_minimum_msat: r.u64()?,
                fee_base_msat: r.u32()?,
                fee_proportional_millionths: r.u32()?,
                htlc_maximum_msat: r.u64()?,
            }),
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

pub(crate) fn encode_init(w: &mut Writer, m: &InitHostedChannel) {
    w.put_u64(m.max_htlc_value_in_flight_msat);
    w.put_u64(m.htlc_minimum_msat);
    w.put_u16(m.max_accepted_htlcs);
    w.put_u64(m.channel_capacity_msat);
    w.put_u64(m.initial_client_balance_msat);
}

pub(crate) fn decode_init(r: &mut Reader<'_>) -> Result<InitHostedChannel, WireError> {
    Ok(InitHostedChannel {
        max_htlc_value_in_flight_msat: r.u64()?,
        htlc_minimum_msat: r.u64()?,
        max_accepted_htlcs: r.u16()?,
        channel_capacity_msat: r.u64()?,
        initial_client_balance_msat: r.u64()?,
    })
}

pub(crate) fn encode_add_htlc(w: &mut Writer, m: &UpdateAddHtlc) {
    w.put_bytes(m.channel_id.as_bytes());
    w.put_u64(m.id);
    w.put_u64(m.amount_msat);
    w.put_bytes(m.payment_hash.as_bytes());
    w.put_u32(m.cltv_expiry);
    w.put_bytes(&m.onion_routing_packet);
}

pub(crate) fn decode_add_htlc(r: &mut Reader<'_>) -> Result<UpdateAddHtlc, WireError> {
    Ok(UpdateAddHtlc {
        channel_id: ChannelId(r.array32()?),
        id: r.u64()?,
        amount_msat: r.u64()?,
        payment_hash: PaymentHash(r.array32()?),
        cltv_expiry: r.u32()?,
        onion_routing_packet: r.remaining(),
    })
}

/// Decode a hex-encoded `LastCrossSignedState`, the `parse-lcss` debug
/// helper exposed to the front-end
pub fn parse_lcss(hex_str: &str) -> Result<LastCrossSignedState, WireError> {
    let bytes = hex::decode(hex_str).map_err(|_| WireError::InvalidHex(hex_str.to_string()))?;
    let mut r = Reader::new(&bytes);
    LastCrossSignedState::decode(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: HostedMessage) {
        let frame = msg.encode_frame();
        let decoded = HostedMessage::decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_framing_layout() {
        let msg = HostedMessage::AskBrandingInfo(AskBrandingInfo {
            chain_hash: [7u8; 32],
        });
        let frame = msg.encode_frame();
        assert_eq!(&frame[..2], &TAG_ASK_BRANDING_INFO.to_be_bytes());
        assert_eq!(&frame[2..4], &32u16.to_be_bytes());
        assert_eq!(frame.len(), 4 + 32);
    }

    #[test]
    fn test_message_roundtrips() {
        roundtrip(HostedMessage::Invoke(InvokeHostedChannel {
            chain_hash: [1u8; 32],
            refund_script_pub_key: vec![0x00, 0x14, 0xab],
            secret: vec![],
        }));
        roundtrip(HostedMessage::Init(InitHostedChannel {
            max_htlc_value_in_flight_msat: 100_000_000,
            htlc_minimum_msat: 1000,
            max_accepted_htlcs: 12,
            channel_capacity_msat: 100_000_000,
            initial_client_balance_msat: 0,
        }));
        roundtrip(HostedMessage::StateUpdate(StateUpdate {
            block_day: 5000,
            local_updates: 3,
            remote_updates: 4,
            local_sig_of_remote_lcss: Signature64([9u8; 64]),
        }));
        roundtrip(HostedMessage::AddHtlc(UpdateAddHtlc {
            channel_id: ChannelId([2u8; 32]),
            id: 1,
            amount_msat: 10_000,
            payment_hash: PaymentHash([3u8; 32]),
            cltv_expiry: 800_200,
            onion_routing_packet: vec![0u8; 1366],
        }));
        roundtrip(HostedMessage::FailHtlc(UpdateFailHtlc {
            channel_id: ChannelId([2u8; 32]),
            id: 9,
            reason: vec![1, 2, 3],
        }));
    }

    #[test]
    fn test_error_code_extraction() {
        let err = ErrorMessage::coded(ChannelId([0u8; 32]), ERR_HOSTED_MANUAL_SUSPEND, "suspended");
        assert_eq!(err.code(), Some("0008"));
        assert_eq!(err.description(), "0008 suspended");

        let opaque = ErrorMessage {
            channel_id: ChannelId([0u8; 32]),
            data: b"xx".to_vec(),
        };
        assert_eq!(opaque.code(), None);
    }

    #[test]
    fn test_bad_frame_rejected() {
        let msg = HostedMessage::AskBrandingInfo(AskBrandingInfo {
            chain_hash: [7u8; 32],
        });
        let mut frame = msg.encode_frame();
        frame.truncate(frame.len() - 1);
        assert!(matches!(
            HostedMessage::decode_frame(&frame),
            Err(WireError::BadFrameLength { .. })
        ));
        assert!(matches!(
            HostedMessage::decode_frame(&[0x00, 0x01, 0x00, 0x00]),
            Err(WireError::UnknownTag(1))
        ));
    }
}
