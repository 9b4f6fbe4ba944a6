//! Shared primitives for hosted channels
//!
//! This module defines the small value types the rest of the crate is built
//! on: millisatoshi amounts as they appear on the JSON boundary, payment
//! hashes and preimages, and the deterministic channel identifiers derived
//! from the two node pubkeys.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Blocks per "block day", the coarse staleness unit used in signed states
pub const BLOCKS_PER_DAY: u32 = 144;

/// Convert a block height to its block day
pub fn block_day(height: u32) -> u32 {
    height / BLOCKS_PER_DAY
}

/// Error types for primitive parsing
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid short channel id: {0}")]
    InvalidShortChannelId(String),
}

/// Parse a boundary millisatoshi value that may arrive as a bare JSON
/// number or as a `"123msat"` string
pub fn parse_msat(value: &serde_json::Value) -> Result<u64, TypeError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| TypeError::InvalidAmount(n.to_string())),
        serde_json::Value::String(s) => {
            let digits = s.strip_suffix("msat").unwrap_or(s);
            digits
                .parse::<u64>()
                .map_err(|_| TypeError::InvalidAmount(s.clone()))
        }
        other => Err(TypeError::InvalidAmount(other.to_string())),
    }
}

/// Serde adapter for fields that accept both msat forms
pub mod msat_serde {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        super::parse_msat(&value).map_err(serde::de::Error::custom)
    }
}

/// Serde adapters rendering byte blobs as hex strings on disk
pub mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Payment hash - SHA256 hash of a payment preimage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, TypeError> {
        let bytes =
            hex::decode(hex_str).map_err(|_| TypeError::InvalidHex(hex_str.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidHex(hex_str.to_string()));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Payment preimage - 32 bytes whose SHA256 gates an HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
    pub fn new(preimage: [u8; 32]) -> Self {
        Self(preimage)
    }

    pub fn new_random() -> Self {
        use rand::RngCore;
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        Self(preimage)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, TypeError> {
        let hash = PaymentHash::from_hex(hex_str)?;
        Ok(Self(hash.0))
    }

    /// Compute the payment hash gated by this preimage
    pub fn payment_hash(&self) -> PaymentHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        PaymentHash(hasher.finalize().into())
    }

    /// Constant-time check against an expected payment hash
    pub fn matches(&self, hash: &PaymentHash) -> bool {
        self.payment_hash().0.ct_eq(&hash.0).into()
    }
}

/// Compact deterministic channel identifier
///
/// Hosted channels have no funding outpoint, so the id is a pure function
/// of the two parties: the byte-wise XOR of the 32-byte x-coordinates of
/// both compressed pubkeys. XOR is commutative, so the id is stable no
/// matter which side computes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn from_peers(a: &PublicKey, b: &PublicKey) -> Self {
        let a = a.serialize();
        let b = b.serialize();
        let mut id = [0u8; 32];
        for i in 0..32 {
            id[i] = a[i + 1] ^ b[i + 1];
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Short channel id in the usual block x tx x output packing
///
/// For hosted channels the packing is synthetic: the raw u64 is taken from
/// the first eight bytes of `sha256(min_pubkey || max_pubkey)`, which keeps
/// it deterministic, order-independent and collision-resistant without any
/// on-chain anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub fn from_peers(a: &PublicKey, b: &PublicKey) -> Self {
        let a = a.serialize();
        let b = b.serialize();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(lo);
        hasher.update(hi);
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(raw))
    }

    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xff_ffff) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('x');
        let parse = |part: Option<&str>| -> Result<u64, TypeError> {
            part.and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| TypeError::InvalidShortChannelId(s.to_string()))
        };
        let block = parse(parts.next())?;
        let tx = parse(parts.next())?;
        let output = parse(parts.next())?;
        if parts.next().is_some() || block > 0xff_ffff || tx > 0xff_ffff || output > 0xffff {
            return Err(TypeError::InvalidShortChannelId(s.to_string()));
        }
        Ok(Self((block << 40) | (tx << 16) | output))
    }
}

/// Identifies one HTLC within one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HtlcIdentifier {
    /// Channel the HTLC lives on
    pub short_channel_id: ShortChannelId,

    /// Per-channel HTLC id
    pub htlc_id: u64,
}

impl HtlcIdentifier {
    pub fn new(short_channel_id: ShortChannelId, htlc_id: u64) -> Self {
        Self {
            short_channel_id,
            htlc_id,
        }
    }
}

impl fmt::Display for HtlcIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.short_channel_id, self.htlc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn test_pubkey(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed.max(1); 32]).expect("valid secret key");
        PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn test_msat_both_forms() {
        assert_eq!(parse_msat(&serde_json::json!(1234)).unwrap(), 1234);
        assert_eq!(parse_msat(&serde_json::json!("1234msat")).unwrap(), 1234);
        assert_eq!(parse_msat(&serde_json::json!("1234")).unwrap(), 1234);
        assert!(parse_msat(&serde_json::json!("12x34msat")).is_err());
        assert!(parse_msat(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn test_preimage_hash_roundtrip() {
        let preimage = PaymentPreimage::new_random();
        let hash = preimage.payment_hash();
        assert!(preimage.matches(&hash));
        assert_eq!(PaymentHash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn test_channel_ids_order_independent() {
        let a = test_pubkey(1);
        let b = test_pubkey(2);
        assert_eq!(ChannelId::from_peers(&a, &b), ChannelId::from_peers(&b, &a));
        assert_eq!(
            ShortChannelId::from_peers(&a, &b),
            ShortChannelId::from_peers(&b, &a)
        );
        assert_ne!(
            ShortChannelId::from_peers(&a, &b),
            ShortChannelId::from_peers(&a, &test_pubkey(3))
        );
    }

    #[test]
    fn test_scid_string_roundtrip() {
        let scid = ShortChannelId((700_123u64 << 40) | (45u64 << 16) | 2);
        let parsed: ShortChannelId = scid.to_string().parse().unwrap();
        assert_eq!(parsed, scid);
        assert!("1x2".parse::<ShortChannelId>().is_err());
    }
}
