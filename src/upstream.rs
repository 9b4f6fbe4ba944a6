//! Upstream node interface
//!
//! Narrow abstraction over the Lightning node this provider extends. The
//! front-end implements [`UpstreamNode`] against the node's RPC and feeds
//! [`UpstreamEvent`]s into the channel master; everything else in the crate
//! stays node-agnostic.

use crate::types::{HtlcIdentifier, PaymentHash, PaymentPreimage, ShortChannelId};
use async_trait::async_trait;
use secp256k1::PublicKey;
use thiserror::Error;

/// Error types for upstream node calls
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),
}

/// Status of a payment previously sent out through the upstream node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingStatus {
    /// Still in flight
    Pending,

    /// Settled; the preimage lets us claim our inbound HTLC
    Complete(PaymentPreimage),

    /// Failed, optionally with the failure onion returned by the route
    Failed(Option<Vec<u8>>),
}

/// The upstream Lightning node, as seen by the hosted-channel core
#[async_trait]
pub trait UpstreamNode: Send + Sync {
    /// Network name the node runs on (`bitcoin`, `testnet`, `signet`,
    /// `regtest`)
    async fn network(&self) -> Result<String, UpstreamError>;

    /// Current chain tip height
    async fn block_height(&self) -> Result<u32, UpstreamError>;

    /// Node id of the upstream node (our identity towards hosted peers)
    fn node_id(&self) -> PublicKey;

    /// Node secret used for LCSS signatures and onion peeling
    fn node_secret(&self) -> secp256k1::SecretKey;

    /// Deliver a framed hosted-channel message to a connected peer
    async fn send_custom_message(
        &self,
        peer: &PublicKey,
        frame: Vec<u8>,
    ) -> Result<(), UpstreamError>;

    /// Send a payment onion towards `outgoing_channel`, labeled with the
    /// incoming HTLC it settles so later sendpay events can be routed back
    async fn send_onion(
        &self,
        label: HtlcIdentifier,
        outgoing_channel: ShortChannelId,
        amount_msat: u64,
        cltv_expiry: u32,
        payment_hash: PaymentHash,
        onion: Vec<u8>,
    ) -> Result<(), UpstreamError>;

    /// Look up the status of an outgoing payment by its label and hash
    async fn inspect_outgoing_payment(
        &self,
        label: HtlcIdentifier,
        payment_hash: PaymentHash,
    ) -> Result<OutgoingStatus, UpstreamError>;

    /// Fresh bech32 address of the node's wallet; its witness program
    /// becomes our refund script when we act as a client
    async fn new_address(&self) -> Result<String, UpstreamError>;
}

/// Inbound events from the upstream node, demultiplexed by the master
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// A custom message frame arrived from a peer
    CustomMessage { peer: PublicKey, frame: Vec<u8> },

    /// The node accepted an HTLC whose onion routes through one of our
    /// hosted channels
    HtlcAccepted {
        incoming: HtlcIdentifier,
        payment_hash: PaymentHash,
        amount_msat: u64,
        cltv_expiry: u32,
        outgoing_channel: ShortChannelId,
        amount_to_forward_msat: u64,
        outgoing_cltv: u32,
        next_onion: Vec<u8>,
    },

    /// A payment we sent out settled
    SendpaySuccess {
        label: HtlcIdentifier,
        payment_hash: PaymentHash,
        preimage: PaymentPreimage,
    },

    /// A payment we sent out failed, or is reported still pending
    SendpayFailure {
        label: HtlcIdentifier,
        payment_hash: PaymentHash,
        failure_onion: Option<Vec<u8>>,
        still_pending: bool,
    },

    Connected(PublicKey),
    Disconnected(PublicKey),
}
