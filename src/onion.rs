//! Onion routing facade
//!
//! Sphinx construction and peeling live behind the [`OnionHandler`] trait:
//! the channel state machine only needs this hop's payload, the onion for
//! the next hop, and a shared secret for wrapping failures on the way back.
//! BOLT-4 failure messages are modeled here as well since they travel
//! inside failure onions.

use crate::types::ShortChannelId;
use secp256k1::SecretKey;
use thiserror::Error;

/// BOLT-4 failure code flag bits
pub const FAILURE_FLAG_BADONION: u16 = 0x8000;
pub const FAILURE_FLAG_PERM: u16 = 0x4000;
pub const FAILURE_FLAG_NODE: u16 = 0x2000;
pub const FAILURE_FLAG_UPDATE: u16 = 0x1000;

/// Per-payment failure reported back along the route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMessage {
    TemporaryChannelFailure,
    PermanentChannelFailure,
    TemporaryNodeFailure,
    IncorrectOrUnknownPaymentDetails,
    InvalidOnionPayload,
    InvalidOnionVersion,
    InvalidOnionHmac,
    InvalidOnionKey,
}

impl FailureMessage {
    pub fn code(&self) -> u16 {
        match self {
            FailureMessage::TemporaryChannelFailure => FAILURE_FLAG_UPDATE | 7,
            FailureMessage::PermanentChannelFailure => FAILURE_FLAG_PERM | 8,
            FailureMessage::TemporaryNodeFailure => FAILURE_FLAG_NODE | 2,
            FailureMessage::IncorrectOrUnknownPaymentDetails => FAILURE_FLAG_PERM | 15,
            FailureMessage::InvalidOnionPayload => FAILURE_FLAG_PERM | 22,
            FailureMessage::InvalidOnionVersion => {
                FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 4
            }
            FailureMessage::InvalidOnionHmac => FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 5,
            FailureMessage::InvalidOnionKey => FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 6,
        }
    }

    /// Whether the failure must be reported as `UpdateFailMalformedHtlc`
    pub fn is_bad_onion(&self) -> bool {
        self.code() & FAILURE_FLAG_BADONION != 0
    }

    /// Raw failure message bytes: code followed by (empty) data
    pub fn encode(&self) -> Vec<u8> {
        self.code().to_be_bytes().to_vec()
    }
}

/// This hop's instructions for a payment to be relayed onward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPayload {
    pub outgoing_channel: ShortChannelId,
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv: u32,
}

/// This hop's instructions when it is the payment destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalPayload {
    pub amount_msat: u64,
    pub cltv_expiry: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeledPayload {
    Relay(RelayPayload),
    Final(FinalPayload),
}

/// Result of peeling one onion layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeledOnion {
    pub payload: PeeledPayload,

    /// Onion to pass to the next hop (all zeros for a final payload)
    pub next_onion: Vec<u8>,

    /// ECDH secret of this hop, needed to wrap failures flowing back
    pub shared_secret: [u8; 32],
}

/// Error types for onion processing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OnionError {
    /// The packet could not be processed at all; reported upstream as
    /// `UpdateFailMalformedHtlc` with the given code
    #[error("Malformed onion (code {failure_code:#06x})")]
    Malformed {
        sha256_of_onion: [u8; 32],
        failure_code: u16,
    },

    /// The packet decrypted but its payload is unusable
    #[error("Onion payload failure: {0:?}")]
    Failure(FailureMessage),
}

/// Sphinx operations the channel depends on
///
/// Implemented outside this crate (or by test fixtures); all operations are
/// pure functions of their inputs.
pub trait OnionHandler: Send + Sync {
    /// Peel one layer of `onion` addressed to `node_secret`, bound to
    /// `payment_hash` as associated data
    fn peel(
        &self,
        node_secret: &SecretKey,
        payment_hash: &[u8; 32],
        onion: &[u8],
    ) -> Result<PeeledOnion, OnionError>;

    /// Wrap a failure originating at this hop for the incoming direction
    fn failure_onion(&self, shared_secret: &[u8; 32], failure: &FailureMessage) -> Vec<u8>;

    /// Re-wrap a failure onion received from downstream under the incoming
    /// hop's shared secret
    fn wrap_failure_onion(&self, shared_secret: &[u8; 32], onion: Vec<u8>) -> Vec<u8>;
}
