//! Per-peer hosted channel state machine
//!
//! One instance per peer. Consumes peer messages and upstream events,
//! mutates the durable record through the store, and emits messages back to
//! the peer or commands for the master (forwards that need routing, delayed
//! resyncs). Status is derived from the record and a little transient
//! scratch, never stored.
//!
//! Fulfillments are resolved toward the upstream side as soon as the peer
//! reveals a preimage, before the corresponding cross-signed commit: the
//! preimage is what lets us claim our inbound HTLC, and waiting for the
//! peer's countersignature would let a stalling peer outlast the inbound
//! CLTV. The standard hosted-channel tradeoff.

use crate::config::HostedConfig;
use crate::lcss::LastCrossSignedState;
use crate::onion::{FailureMessage, OnionError, OnionHandler, PeeledPayload, RelayPayload};
use crate::state::{UpdateMessage, UpdateOrigin, UpdateQueue};
use crate::store::{ChannelRecord, DetailedError, Store, StoreError};
use crate::types::{
    block_day, ChannelId, HtlcIdentifier, PaymentHash, PaymentPreimage, ShortChannelId,
};
use crate::upstream::{UpstreamError, UpstreamNode};
use crate::wire::{
    ChannelUpdate, ErrorMessage, HostedMessage, InitHostedChannel, InvokeHostedChannel,
    Signature64, StateOverride, StateUpdate, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFulfillHtlc, WireError, ERR_HOSTED_CHANNEL_DENIED,
    ERR_HOSTED_CLOSED_BY_REMOTE_PEER, ERR_HOSTED_MANUAL_SUSPEND,
    ERR_HOSTED_TIMED_OUT_OUTGOING_HTLC, ERR_HOSTED_WRONG_BLOCKDAY, ERR_HOSTED_WRONG_LOCAL_SIG,
    ERR_HOSTED_WRONG_REMOTE_SIG,
};
use secp256k1::{All, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How many of our own StateUpdate fingerprints we remember for debouncing
const SENT_STATE_UPDATE_MEMORY: usize = 3;

/// Error types for channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Only the host side can do this")]
    NotHost,

    #[error("Invalid refund address: {0}")]
    InvalidRefundAddress(String),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Derived channel status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    NotOpened,
    Opening,
    Invoking,
    Active,
    Overriding,
    Errored,
    Suspended,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelStatus::NotOpened => "not-opened",
            ChannelStatus::Opening => "opening",
            ChannelStatus::Invoking => "invoking",
            ChannelStatus::Active => "active",
            ChannelStatus::Overriding => "overriding",
            ChannelStatus::Errored => "errored",
            ChannelStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Resolution of an incoming HTLC toward the upstream side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcResolution {
    /// Settle with this preimage
    Fulfill(PaymentPreimage),

    /// Fail with a failure originating at this hop
    Fail(FailureMessage),

    /// Fail with an encrypted failure onion from downstream
    FailOnion(Vec<u8>),
}

/// Outcome of an HTLC we forwarded out, as reported back to the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingFailure {
    /// Encrypted failure onion to pass back
    Onion(Vec<u8>),

    /// Failure message originating at or before the forwarding hop
    Message(FailureMessage),

    /// The next hop could not process the onion
    BadOnion {
        sha256_of_onion: [u8; 32],
        failure_code: u16,
    },
}

pub type OutgoingResult = Result<PaymentPreimage, OutgoingFailure>;

/// A committed remote HTLC that must now be forwarded; the master decides
/// whether it targets another hosted channel or the upstream network
#[derive(Debug, Clone)]
pub struct ForwardCmd {
    pub incoming: HtlcIdentifier,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub relay: RelayPayload,
    pub next_onion: Vec<u8>,
}

/// Deferred work a channel hands back to the master
#[derive(Debug, Clone)]
pub enum ChannelAction {
    Forward(ForwardCmd),

    /// Re-inspect committed incoming HTLCs after the reconnect grace delay
    ResyncIncoming,
}

/// A committed incoming HTLC whose resolution the master should chase
#[derive(Debug, Clone)]
pub struct ResyncItem {
    pub incoming: HtlcIdentifier,
    pub payment_hash: PaymentHash,
    pub forwarded_to: Option<HtlcIdentifier>,
}

/// Shared services every channel needs
pub struct ChannelContext {
    pub config: Arc<HostedConfig>,
    pub store: Arc<Store>,
    pub upstream: Arc<dyn UpstreamNode>,
    pub onion: Arc<dyn OnionHandler>,
    pub secp: Secp256k1<All>,
    pub chain_hash: [u8; 32],

    /// One-shot invocation secrets added at runtime, consumed on use
    pub temporary_secrets: StdMutex<HashSet<Vec<u8>>>,
}

impl ChannelContext {
    pub fn new(
        config: Arc<HostedConfig>,
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamNode>,
        onion: Arc<dyn OnionHandler>,
        chain_hash: [u8; 32],
    ) -> Self {
        Self {
            config,
            store,
            upstream,
            onion,
            secp: Secp256k1::new(),
            chain_hash,
            temporary_secrets: StdMutex::new(HashSet::new()),
        }
    }
}

/// One hosted channel with one peer
pub struct HostedChannel {
    peer: PublicKey,
    ctx: Arc<ChannelContext>,

    /// Cached copy of the persisted record; every mutation goes through
    /// `persist_record`
    record: ChannelRecord,

    queue: UpdateQueue,

    /// One-shot resolution cells keyed by the id of OUR outgoing HTLC
    resolvers: HashMap<u64, oneshot::Sender<HtlcResolution>>,

    /// Host scratch: Invoke accepted, awaiting the client's StateUpdate
    opening_refund_script: Option<Vec<u8>>,

    /// Client scratch: Invoke sent, awaiting InitHostedChannel
    invoking_refund_script: Option<Vec<u8>>,

    /// Client scratch: initial state awaiting the host's countersignature
    invoking_lcss: Option<LastCrossSignedState>,

    /// Relay instructions of remote adds peeled at accept time, acted on
    /// when the add commits
    peeled_adds: HashMap<u64, (RelayPayload, Vec<u8>)>,

    /// Remote adds that must be failed (not forwarded) once they commit
    failed_adds: HashMap<u64, FailureMessage>,

    /// Shared secrets of incoming HTLC onions, for wrapping failures back
    incoming_secrets: HashMap<u64, [u8; 32]>,

    /// Fingerprints of recently sent StateUpdates
    recent_state_updates: VecDeque<[u8; 32]>,

    current_height: u32,
}

impl HostedChannel {
    pub fn new(peer: PublicKey, ctx: Arc<ChannelContext>, current_height: u32) -> Self {
        let record = ctx.store.channel(&hex::encode(peer.serialize()));
        Self {
            peer,
            ctx,
            record,
            queue: UpdateQueue::new(),
            resolvers: HashMap::new(),
            opening_refund_script: None,
            invoking_refund_script: None,
            invoking_lcss: None,
            peeled_adds: HashMap::new(),
            failed_adds: HashMap::new(),
            incoming_secrets: HashMap::new(),
            recent_state_updates: VecDeque::new(),
            current_height,
        }
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub fn peer_hex(&self) -> String {
        hex::encode(self.peer.serialize())
    }

    pub fn record(&self) -> &ChannelRecord {
        &self.record
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId::from_peers(&self.ctx.upstream.node_id(), &self.peer)
    }

    pub fn short_channel_id(&self) -> ShortChannelId {
        ShortChannelId::from_peers(&self.ctx.upstream.node_id(), &self.peer)
    }

    pub fn status(&self) -> ChannelStatus {
        if self.opening_refund_script.is_some() {
            ChannelStatus::Opening
        } else if self.invoking_refund_script.is_some() || self.invoking_lcss.is_some() {
            ChannelStatus::Invoking
        } else if self.record.proposed_override.is_some() {
            ChannelStatus::Overriding
        } else if !self.record.local_errors.is_empty() {
            ChannelStatus::Errored
        } else if self.record.suspended {
            ChannelStatus::Suspended
        } else if self.record.lcss.is_none() {
            ChannelStatus::NotOpened
        } else {
            ChannelStatus::Active
        }
    }

    /// Committed state plus every uncommitted update, stamped with today's
    /// block day
    pub fn pending_state(&self) -> Option<LastCrossSignedState> {
        let committed = self.record.lcss.as_ref()?;
        let mut next = self.queue.next_state(committed);
        next.block_day = block_day(self.current_height);
        Some(next)
    }

    fn persist_record(&self) -> Result<(), StoreError> {
        let peer_hex = self.peer_hex();
        let record = self.record.clone();
        self.ctx.store.update(move |data| {
            data.channels.insert(peer_hex, record);
        })
    }

    async fn send(&self, msg: HostedMessage) -> Result<(), UpstreamError> {
        self.ctx
            .upstream
            .send_custom_message(&self.peer, msg.encode_frame())
            .await
    }

    /// Record a protocol error, transitioning the channel to Errored, and
    /// return the wire error to send
    fn record_local_error(
        &mut self,
        code: &str,
        reason: &str,
        htlc: Option<UpdateAddHtlc>,
    ) -> Result<ErrorMessage, StoreError> {
        let error = ErrorMessage::coded(self.channel_id(), code, reason);
        let detailed = DetailedError {
            error: error.clone(),
            htlc,
            description: reason.to_string(),
        };
        if !self.record.local_errors.contains(&detailed) {
            self.record.local_errors.push(detailed);
            self.persist_record()?;
        }
        warn!(peer = %self.peer_hex(), code, reason, "Channel errored");
        Ok(error)
    }

    /// Send our signed StateUpdate for the current pending state, unless an
    /// identical one already went out recently
    async fn send_state_update(&mut self) -> Result<(), UpstreamError> {
        let next = match self.pending_state() {
            Some(next) => next,
            None => return Ok(()),
        };
        let mut hasher = Sha256::new();
        hasher.update(next.encode_for_signing());
        hasher.update((self.queue.len() as u32).to_be_bytes());
        let fingerprint: [u8; 32] = hasher.finalize().into();
        if self.recent_state_updates.contains(&fingerprint) {
            debug!(peer = %self.peer_hex(), "StateUpdate debounced");
            return Ok(());
        }

        let sig = next.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());
        let update = StateUpdate {
            block_day: next.block_day,
            local_updates: next.local_updates,
            remote_updates: next.remote_updates,
            local_sig_of_remote_lcss: sig,
        };
        self.send(HostedMessage::StateUpdate(update)).await?;
        if self.recent_state_updates.len() == SENT_STATE_UPDATE_MEMORY {
            self.recent_state_updates.pop_front();
        }
        self.recent_state_updates.push_back(fingerprint);
        Ok(())
    }

    fn channel_update(&self) -> ChannelUpdate {
        let config = &self.ctx.config;
        let capacity = self
            .record
            .lcss
            .as_ref()
            .map(|l| l.init_hosted_channel.channel_capacity_msat)
            .unwrap_or(config.channel_capacity_msat);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let mut update = ChannelUpdate {
            signature: Signature64::ZERO,
            chain_hash: self.ctx.chain_hash,
            short_channel_id: self.short_channel_id(),
            timestamp,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: config.cltv_expiry_delta as u16,
            htlc_minimum_msat: config.htlc_minimum_msat,
            fee_base_msat: config.fee_base_msat as u32,
            fee_proportional_millionths: config.fee_proportional_millionths as u32,
            htlc_maximum_msat: capacity,
        };
        // signature covers everything after the signature field
        let frame = HostedMessage::ChannelUpdate(update.clone()).encode_frame();
        let mut hasher = Sha256::new();
        hasher.update(&frame[4 + 64..]);
        let digest: [u8; 32] = hasher.finalize().into();
        let msg = secp256k1::Message::from_slice(&digest).expect("digest is 32 bytes");
        update.signature = Signature64(
            self.ctx
                .secp
                .sign_ecdsa(&msg, &self.ctx.upstream.node_secret())
                .serialize_compact(),
        );
        update
    }

    fn resolve(&mut self, htlc_id: u64, resolution: HtlcResolution) {
        if let Some(tx) = self.resolvers.remove(&htlc_id) {
            let _ = tx.send(resolution);
        }
    }

    // ------------------------------------------------------------------
    // Upstream-facing operations
    // ------------------------------------------------------------------

    /// Forward an HTLC out through this channel
    ///
    /// The returned receiver resolves when the peer settles or fails the
    /// HTLC, when it is rolled back, or when its CLTV expires.
    pub async fn add_htlc(
        &mut self,
        incoming: HtlcIdentifier,
        in_amount_msat: u64,
        out_amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        next_onion: Vec<u8>,
    ) -> oneshot::Receiver<HtlcResolution> {
        let (tx, rx) = oneshot::channel();
        let snapshot = self.ctx.store.snapshot();

        // a preimage we already know settles the HTLC instantly
        if let Some(preimage) = snapshot.preimages.get(&payment_hash) {
            let _ = tx.send(HtlcResolution::Fulfill(*preimage));
            return rx;
        }

        // replay after restart: the forward already exists, just re-bind
        let our_scid = self.short_channel_id();
        if let Some(out) = snapshot.htlc_forwards.get(&incoming) {
            if out.short_channel_id == our_scid {
                debug!(peer = %self.peer_hex(), %incoming, "Re-binding existing forward");
                self.resolvers.insert(out.htlc_id, tx);
                return rx;
            }
        }

        if let Some(failure) = self.admission_failure(
            in_amount_msat,
            out_amount_msat,
            &payment_hash,
            cltv_expiry,
        ) {
            let _ = tx.send(HtlcResolution::Fail(failure));
            return rx;
        }
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => {
                let _ = tx.send(HtlcResolution::Fail(FailureMessage::TemporaryChannelFailure));
                return rx;
            }
        };
        let next = self.queue.next_state(&committed);

        let add = UpdateAddHtlc {
            channel_id: self.channel_id(),
            id: (next.local_updates + 1) as u64,
            amount_msat: out_amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet: next_onion,
        };
        self.queue.push(
            UpdateOrigin::Local {
                forwarded_from: Some(incoming),
            },
            UpdateMessage::Add(add.clone()),
        );
        match self.send(HostedMessage::AddHtlc(add.clone())).await {
            Ok(()) => {
                if let Err(e) = self.send_state_update().await {
                    warn!(peer = %self.peer_hex(), error = %e, "StateUpdate send failed after add");
                }
                self.resolvers.insert(add.id, tx);
                rx
            }
            Err(e) => {
                warn!(peer = %self.peer_hex(), error = %e, "Add send failed, rolling back");
                self.queue.remove_last_where(
                    |u| matches!(&u.message, UpdateMessage::Add(a) if a.id == add.id),
                );
                let _ = tx.send(HtlcResolution::Fail(FailureMessage::TemporaryChannelFailure));
                rx
            }
        }
    }

    /// First admission check that rejects a new outgoing HTLC, if any
    ///
    /// The duplicate-hash check comes before the status gate: a duplicate
    /// must fail permanently even on an errored channel, or the sender
    /// keeps retrying a payment that is already in flight.
    fn admission_failure(
        &self,
        in_amount_msat: u64,
        out_amount_msat: u64,
        payment_hash: &PaymentHash,
        cltv_expiry: u32,
    ) -> Option<FailureMessage> {
        let next = self
            .record
            .lcss
            .as_ref()
            .map(|committed| self.queue.next_state(committed));
        if next
            .as_ref()
            .map(|n| n.incoming_htlcs.iter().any(|h| h.payment_hash == *payment_hash))
            .unwrap_or(false)
        {
            return Some(FailureMessage::IncorrectOrUnknownPaymentDetails);
        }
        if self.status() != ChannelStatus::Active {
            return Some(FailureMessage::TemporaryChannelFailure);
        }
        if cltv_expiry.saturating_sub(self.current_height) < self.ctx.config.cltv_expiry_delta {
            return Some(FailureMessage::IncorrectOrUnknownPaymentDetails);
        }
        let required_fee = self.ctx.config.fee_base_msat
            + out_amount_msat * self.ctx.config.fee_proportional_millionths / 1_000_000;
        if in_amount_msat.saturating_sub(out_amount_msat) < required_fee {
            return Some(FailureMessage::TemporaryChannelFailure);
        }
        match self.record.lcss.as_ref() {
            Some(committed) if self.queue.would_overdraw(committed, out_amount_msat, 0) => {
                Some(FailureMessage::TemporaryChannelFailure)
            }
            Some(_) => None,
            None => Some(FailureMessage::TemporaryChannelFailure),
        }
    }

    /// Settle or fail an incoming HTLC after its forwarded counterpart
    /// resolved; `None` means the forward is still pending
    pub async fn got_payment_result(
        &mut self,
        htlc_id: u64,
        result: Option<OutgoingResult>,
    ) -> Result<(), ChannelError> {
        let result = match result {
            Some(result) => result,
            None => return Ok(()),
        };
        match self.status() {
            ChannelStatus::Active | ChannelStatus::Errored | ChannelStatus::Suspended => {}
            other => {
                debug!(peer = %self.peer_hex(), status = %other, "Ignoring payment result");
                return Ok(());
            }
        }
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(()),
        };

        match result {
            Ok(preimage) => {
                // keep the preimage durable before telling anyone, so a
                // crash between here and the commit can still claim
                self.ctx.store.update(|data| {
                    data.preimages.insert(preimage.payment_hash(), preimage);
                })?;
                let fulfill = UpdateFulfillHtlc {
                    channel_id: self.channel_id(),
                    id: htlc_id,
                    payment_preimage: preimage,
                };
                self.queue.push(
                    UpdateOrigin::Local {
                        forwarded_from: None,
                    },
                    UpdateMessage::Fulfill(fulfill.clone()),
                );
                match self.send(HostedMessage::FulfillHtlc(fulfill)).await {
                    Ok(()) => {
                        if self.status() == ChannelStatus::Active {
                            if let Err(e) = self.send_state_update().await {
                                warn!(peer = %self.peer_hex(), error = %e, "StateUpdate send failed after fulfill");
                            }
                        }
                    }
                    Err(e) => {
                        // roll back; the preimage entry stays for the retry
                        warn!(peer = %self.peer_hex(), error = %e, "Fulfill send failed, rolling back");
                        self.queue.remove_last_where(|u| {
                            matches!(&u.message, UpdateMessage::Fulfill(f) if f.id == htlc_id)
                        });
                    }
                }
            }
            Err(failure) => {
                if committed.incoming_htlc(htlc_id).is_none() {
                    debug!(peer = %self.peer_hex(), htlc_id, "Failure for unknown incoming HTLC");
                    return Ok(());
                }
                let message = match failure {
                    OutgoingFailure::BadOnion {
                        sha256_of_onion,
                        failure_code,
                    } => UpdateMessage::FailMalformed(UpdateFailMalformedHtlc {
                        channel_id: self.channel_id(),
                        id: htlc_id,
                        sha256_of_onion,
                        failure_code,
                    }),
                    OutgoingFailure::Onion(onion) => {
                        let reason = match self.incoming_secrets.get(&htlc_id) {
                            Some(secret) => self.ctx.onion.wrap_failure_onion(secret, onion),
                            None => onion,
                        };
                        UpdateMessage::Fail(UpdateFailHtlc {
                            channel_id: self.channel_id(),
                            id: htlc_id,
                            reason,
                        })
                    }
                    OutgoingFailure::Message(msg) => {
                        let reason = match self.incoming_secrets.get(&htlc_id) {
                            Some(secret) => self.ctx.onion.failure_onion(secret, &msg),
                            None => msg.encode(),
                        };
                        UpdateMessage::Fail(UpdateFailHtlc {
                            channel_id: self.channel_id(),
                            id: htlc_id,
                            reason,
                        })
                    }
                };
                let wire = match &message {
                    UpdateMessage::Fail(f) => HostedMessage::FailHtlc(f.clone()),
                    UpdateMessage::FailMalformed(f) => HostedMessage::FailMalformedHtlc(f.clone()),
                    _ => unreachable!("fail path builds fail messages"),
                };
                self.queue.push(
                    UpdateOrigin::Local {
                        forwarded_from: None,
                    },
                    message,
                );
                match self.send(wire).await {
                    Ok(()) => {
                        if self.status() == ChannelStatus::Active {
                            if let Err(e) = self.send_state_update().await {
                                warn!(peer = %self.peer_hex(), error = %e, "StateUpdate send failed after fail");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %self.peer_hex(), error = %e, "Fail send failed, rolling back");
                        self.queue
                            .remove_last_where(|u| u.message.htlc_id() == htlc_id && u.origin.is_local());
                    }
                }
            }
        }
        Ok(())
    }

    /// Act as a client: ask the peer to host a channel for us
    pub async fn request_hosted_channel(&mut self) -> Result<(), ChannelError> {
        if self.status() != ChannelStatus::NotOpened {
            return Err(ChannelError::InvalidState(format!(
                "cannot request hosted channel while {}",
                self.status()
            )));
        }
        let address = self.ctx.upstream.new_address().await?;
        let script = refund_script_from_address(&address)?;
        self.invoking_refund_script = Some(script.clone());
        self.send(HostedMessage::Invoke(InvokeHostedChannel {
            chain_hash: self.ctx.chain_hash,
            refund_script_pub_key: script,
            secret: Vec::new(),
        }))
        .await?;
        Ok(())
    }

    /// Host-side recovery: propose to reset the channel to the given local
    /// balance, wiping in-flight HTLCs
    pub async fn propose_override(
        &mut self,
        new_local_balance_msat: u64,
    ) -> Result<(), ChannelError> {
        match self.status() {
            ChannelStatus::Errored | ChannelStatus::Overriding => {}
            other => {
                return Err(ChannelError::InvalidState(format!(
                    "cannot override while {other}"
                )))
            }
        }
        let committed = self
            .record
            .lcss
            .clone()
            .ok_or_else(|| ChannelError::InvalidState("no committed state".into()))?;
        if !committed.is_host {
            return Err(ChannelError::NotHost);
        }
        let capacity = committed.init_hosted_channel.channel_capacity_msat;
        if new_local_balance_msat > capacity {
            return Err(ChannelError::InvalidState(format!(
                "override balance {new_local_balance_msat} exceeds capacity {capacity}"
            )));
        }

        let mut proposal = committed;
        proposal.incoming_htlcs.clear();
        proposal.outgoing_htlcs.clear();
        proposal.local_balance_msat = new_local_balance_msat;
        proposal.remote_balance_msat = capacity - new_local_balance_msat;
        proposal.local_updates += 1;
        proposal.remote_updates += 1;
        proposal.block_day = block_day(self.current_height);
        proposal.remote_sig_of_local = Signature64::ZERO;
        proposal.local_sig_of_remote =
            proposal.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());

        self.record.proposed_override = Some(proposal.clone());
        self.persist_record()?;
        info!(peer = %self.peer_hex(), new_local_balance_msat, "Override proposed");

        self.send(HostedMessage::StateOverride(StateOverride {
            block_day: proposal.block_day,
            local_balance_msat: proposal.local_balance_msat,
            local_updates: proposal.local_updates,
            remote_updates: proposal.remote_updates,
            local_sig_of_remote_lcss: proposal.local_sig_of_remote,
        }))
        .await?;
        Ok(())
    }

    /// React to a new chain tip: time out expired outgoing HTLCs and prune
    /// uncommitted adds that got too close to expiry
    pub async fn on_block_updated(&mut self, height: u32) -> Result<(), ChannelError> {
        self.current_height = height;

        if let Some(lcss) = self.record.lcss.clone() {
            let expired: Vec<UpdateAddHtlc> = lcss
                .outgoing_htlcs
                .iter()
                .filter(|h| h.cltv_expiry < height)
                .filter(|h| {
                    !self
                        .record
                        .local_errors
                        .iter()
                        .any(|e| e.htlc.as_ref().map(|x| x.id) == Some(h.id))
                })
                .cloned()
                .collect();
            if !expired.is_empty() {
                let mut wire_error = None;
                for htlc in &expired {
                    wire_error = Some(self.record_local_error(
                        ERR_HOSTED_TIMED_OUT_OUTGOING_HTLC,
                        &format!("outgoing htlc {} timed out at {}", htlc.id, height),
                        Some(htlc.clone()),
                    )?);
                }
                if let Some(error) = wire_error {
                    if let Err(e) = self.send(HostedMessage::Error(error)).await {
                        warn!(peer = %self.peer_hex(), error = %e, "Error send failed");
                    }
                }
                for htlc in &expired {
                    self.resolve(
                        htlc.id,
                        HtlcResolution::Fail(FailureMessage::PermanentChannelFailure),
                    );
                }
            }
        }

        // local adds whose expiry crept inside our safety delta can no
        // longer be forwarded honestly
        let delta = self.ctx.config.cltv_expiry_delta;
        let doomed = self.queue.drain_where(|u| {
            u.origin.is_local()
                && matches!(&u.message, UpdateMessage::Add(a)
                    if a.cltv_expiry.saturating_sub(height) < delta)
        });
        for update in doomed {
            debug!(peer = %self.peer_hex(), htlc_id = update.message.htlc_id(), "Pruning near-expiry uncommitted add");
            self.resolve(
                update.message.htlc_id(),
                HtlcResolution::Fail(FailureMessage::IncorrectOrUnknownPaymentDetails),
            );
        }
        Ok(())
    }

    /// Chase resolutions for committed incoming HTLCs after a reconnect;
    /// preimage-cache hits are settled inline, the rest are handed to the
    /// master
    pub async fn resync_incoming(&mut self) -> Result<Vec<ResyncItem>, ChannelError> {
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(Vec::new()),
        };
        let snapshot = self.ctx.store.snapshot();
        let our_scid = self.short_channel_id();
        let mut items = Vec::new();
        for htlc in &committed.incoming_htlcs {
            if let Some(preimage) = snapshot.preimages.get(&htlc.payment_hash) {
                self.got_payment_result(htlc.id, Some(Ok(*preimage))).await?;
                continue;
            }
            let incoming = HtlcIdentifier::new(our_scid, htlc.id);
            items.push(ResyncItem {
                incoming,
                payment_hash: htlc.payment_hash,
                forwarded_to: snapshot.htlc_forwards.get(&incoming).copied(),
            });
        }
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Peer message handling
    // ------------------------------------------------------------------

    pub async fn on_peer_message(
        &mut self,
        msg: HostedMessage,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        match msg {
            HostedMessage::AskBrandingInfo(_) => {
                let logo = self
                    .ctx
                    .config
                    .logo_file
                    .as_ref()
                    .and_then(|path| std::fs::read(path).ok());
                if let Some(branding) = self.ctx.config.branding(logo) {
                    self.send(HostedMessage::Branding(branding)).await?;
                }
                Ok(Vec::new())
            }
            HostedMessage::Invoke(m) => self.on_invoke(m).await,
            HostedMessage::Init(m) => self.on_init(m).await,
            HostedMessage::LastCrossSignedState(m) => self.on_remote_lcss(*m).await,
            HostedMessage::StateUpdate(m) => self.on_state_update(m).await,
            HostedMessage::AddHtlc(m) => {
                self.on_remote_add(m).await?;
                Ok(Vec::new())
            }
            HostedMessage::FulfillHtlc(m) => {
                self.on_remote_fulfill(m).await?;
                Ok(Vec::new())
            }
            HostedMessage::FailHtlc(m) => {
                self.on_remote_fail(m).await?;
                Ok(Vec::new())
            }
            HostedMessage::FailMalformedHtlc(m) => {
                if self.status() == ChannelStatus::Active {
                    self.queue.push(UpdateOrigin::Remote, UpdateMessage::FailMalformed(m));
                }
                Ok(Vec::new())
            }
            HostedMessage::Error(m) => {
                self.on_remote_error(m).await?;
                Ok(Vec::new())
            }
            other => {
                debug!(peer = %self.peer_hex(), tag = other.tag(), "Ignoring peer message");
                Ok(Vec::new())
            }
        }
    }

    async fn on_invoke(
        &mut self,
        m: InvokeHostedChannel,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        match self.status() {
            ChannelStatus::NotOpened => {
                if m.chain_hash != self.ctx.chain_hash {
                    let error = ErrorMessage::coded(
                        self.channel_id(),
                        ERR_HOSTED_CHANNEL_DENIED,
                        "wrong chain",
                    );
                    self.send(HostedMessage::Error(error)).await?;
                    return Ok(Vec::new());
                }
                if m.refund_script_pub_key.is_empty() {
                    let error = ErrorMessage::coded(
                        self.channel_id(),
                        ERR_HOSTED_CHANNEL_DENIED,
                        "empty refund script",
                    );
                    self.send(HostedMessage::Error(error)).await?;
                    return Ok(Vec::new());
                }
                if self.ctx.config.require_secret && !self.consume_secret(&m.secret)? {
                    let error = ErrorMessage::coded(
                        self.channel_id(),
                        ERR_HOSTED_CHANNEL_DENIED,
                        "invalid secret",
                    );
                    self.send(HostedMessage::Error(error)).await?;
                    return Ok(Vec::new());
                }
                self.opening_refund_script = Some(m.refund_script_pub_key);
                let init = self.ctx.config.init_hosted_channel();
                self.send(HostedMessage::Init(init)).await?;
                Ok(Vec::new())
            }
            ChannelStatus::Suspended => {
                if let Some(lcss) = self.record.lcss.clone() {
                    self.send(HostedMessage::LastCrossSignedState(Box::new(lcss)))
                        .await?;
                }
                Ok(Vec::new())
            }
            ChannelStatus::Active => self.replay_after_reconnect().await,
            ChannelStatus::Errored => {
                if let Some(lcss) = self.record.lcss.clone() {
                    self.send(HostedMessage::LastCrossSignedState(Box::new(lcss)))
                        .await?;
                }
                if let Some(detailed) = self.record.local_errors.first().cloned() {
                    self.send(HostedMessage::Error(detailed.error)).await?;
                }
                Ok(Vec::new())
            }
            ChannelStatus::Overriding => {
                if let Some(lcss) = self.record.lcss.clone() {
                    self.send(HostedMessage::LastCrossSignedState(Box::new(lcss)))
                        .await?;
                }
                if let Some(detailed) = self.record.local_errors.first().cloned() {
                    self.send(HostedMessage::Error(detailed.error)).await?;
                }
                if let Some(proposal) = self.record.proposed_override.clone() {
                    self.send(HostedMessage::StateOverride(StateOverride {
                        block_day: proposal.block_day,
                        local_balance_msat: proposal.local_balance_msat,
                        local_updates: proposal.local_updates,
                        remote_updates: proposal.remote_updates,
                        local_sig_of_remote_lcss: proposal.local_sig_of_remote,
                    }))
                    .await?;
                }
                Ok(Vec::new())
            }
            other => {
                debug!(peer = %self.peer_hex(), status = %other, "Ignoring Invoke");
                Ok(Vec::new())
            }
        }
    }

    fn consume_secret(&self, secret: &[u8]) -> Result<bool, ChannelError> {
        if secret.is_empty() {
            return Ok(false);
        }
        let permanent = self
            .ctx
            .config
            .permanent_secrets
            .iter()
            .any(|s| hex::decode(s).map(|b| b == secret).unwrap_or(false));
        if permanent {
            return Ok(true);
        }
        let mut temporary = self.ctx.temporary_secrets.lock().expect("secrets lock");
        Ok(temporary.remove(secret))
    }

    /// Reconnect while Active: resend the committed state, replay local
    /// settles first, then local adds with freshly assigned ids, then one
    /// StateUpdate
    async fn replay_after_reconnect(&mut self) -> Result<Vec<ChannelAction>, ChannelError> {
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(Vec::new()),
        };
        self.send(HostedMessage::LastCrossSignedState(Box::new(
            committed.clone(),
        )))
        .await?;

        // fresh connection, the peer has none of our previous sends
        self.recent_state_updates.clear();

        // peer will resend everything it originated
        let dropped_remote = self.queue.drain_where(|u| !u.origin.is_local());
        for update in dropped_remote {
            let id = update.message.htlc_id();
            self.peeled_adds.remove(&id);
            self.failed_adds.remove(&id);
            self.incoming_secrets.remove(&id);
        }

        let locals = self.queue.drain_where(|u| u.origin.is_local());
        let mut replayed = UpdateQueue::new();
        // settles first: their ids reference the peer's HTLCs and stay valid
        for update in locals
            .iter()
            .filter(|u| !matches!(u.message, UpdateMessage::Add(_)))
        {
            let wire = match &update.message {
                UpdateMessage::Fulfill(f) => HostedMessage::FulfillHtlc(f.clone()),
                UpdateMessage::Fail(f) => HostedMessage::FailHtlc(f.clone()),
                UpdateMessage::FailMalformed(f) => HostedMessage::FailMalformedHtlc(f.clone()),
                UpdateMessage::Add(_) => continue,
            };
            replayed.push(update.origin, update.message.clone());
            self.send(wire).await?;
        }
        // adds second, re-assigned to the next free id
        for update in locals.iter() {
            let add = match &update.message {
                UpdateMessage::Add(add) => add,
                _ => continue,
            };
            let next = replayed.next_state(&committed);
            let mut replay_add = add.clone();
            replay_add.id = (next.local_updates + 1) as u64;
            if replay_add.id != add.id {
                if let Some(tx) = self.resolvers.remove(&add.id) {
                    self.resolvers.insert(replay_add.id, tx);
                }
            }
            replayed.push(update.origin, UpdateMessage::Add(replay_add.clone()));
            self.send(HostedMessage::AddHtlc(replay_add)).await?;
        }
        self.queue = replayed;
        self.send_state_update().await?;
        Ok(Vec::new())
    }

    /// Client side: the host accepted our invocation
    async fn on_init(&mut self, m: InitHostedChannel) -> Result<Vec<ChannelAction>, ChannelError> {
        let refund = match (self.status(), self.invoking_refund_script.clone()) {
            (ChannelStatus::Invoking, Some(refund)) => refund,
            (status, _) => {
                debug!(peer = %self.peer_hex(), %status, "Ignoring InitHostedChannel");
                return Ok(Vec::new());
            }
        };
        if m.initial_client_balance_msat > m.channel_capacity_msat {
            warn!(peer = %self.peer_hex(), "Host offered client balance above capacity");
            return Ok(Vec::new());
        }
        let mut lcss = LastCrossSignedState {
            is_host: false,
            refund_script_pub_key: refund,
            block_day: block_day(self.current_height),
            local_balance_msat: m.initial_client_balance_msat,
            remote_balance_msat: m.channel_capacity_msat - m.initial_client_balance_msat,
            init_hosted_channel: m,
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: Vec::new(),
            outgoing_htlcs: Vec::new(),
            remote_sig_of_local: Signature64::ZERO,
            local_sig_of_remote: Signature64::ZERO,
        };
        lcss.local_sig_of_remote =
            lcss.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());
        let update = lcss.state_update();
        self.invoking_lcss = Some(lcss);
        self.invoking_refund_script = None;
        self.send(HostedMessage::StateUpdate(update)).await?;
        Ok(Vec::new())
    }

    /// Full state from the peer: verify, adopt if ahead, then chase our
    /// incoming HTLC resolutions
    async fn on_remote_lcss(
        &mut self,
        msg: LastCrossSignedState,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        match self.status() {
            ChannelStatus::Active | ChannelStatus::Opening | ChannelStatus::Invoking => {}
            other => {
                debug!(peer = %self.peer_hex(), status = %other, "Ignoring remote LCSS");
                return Ok(Vec::new());
            }
        }
        let candidate = msg.reverse();
        if !candidate.verify_remote_sig(&self.ctx.secp, &self.peer) {
            let error = self.record_local_error(
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "peer signature on cross-signed state does not verify",
                None,
            )?;
            let _ = self.send(HostedMessage::Error(error)).await;
            return Ok(Vec::new());
        }
        if !msg.verify_remote_sig(&self.ctx.secp, &self.ctx.upstream.node_id()) {
            let error = self.record_local_error(
                ERR_HOSTED_WRONG_LOCAL_SIG,
                "peer-held signature attributed to us does not verify",
                None,
            )?;
            let _ = self.send(HostedMessage::Error(error)).await;
            return Ok(Vec::new());
        }

        let ahead = match &self.record.lcss {
            Some(ours) => candidate.is_ahead_of(ours),
            None => true,
        };
        if ahead {
            info!(
                peer = %self.peer_hex(),
                local_updates = candidate.local_updates,
                remote_updates = candidate.remote_updates,
                "Catching up to peer state"
            );
            self.record.lcss = Some(candidate);
            self.persist_record()?;
            // stale scratch dies with the old state
            self.opening_refund_script = None;
            self.invoking_refund_script = None;
            self.invoking_lcss = None;
            self.queue = UpdateQueue::new();
            self.peeled_adds.clear();
            self.failed_adds.clear();
        }

        if let Some(lcss) = self.record.lcss.clone() {
            self.send(HostedMessage::LastCrossSignedState(Box::new(lcss)))
                .await?;
        }
        self.send(HostedMessage::ChannelUpdate(self.channel_update()))
            .await?;
        Ok(vec![ChannelAction::ResyncIncoming])
    }

    async fn on_state_update(
        &mut self,
        m: StateUpdate,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        match self.status() {
            ChannelStatus::Opening => {
                self.finalize_opening(m).await?;
                Ok(Vec::new())
            }
            ChannelStatus::Invoking if self.invoking_lcss.is_some() => {
                self.finalize_invoking(m).await?;
                Ok(Vec::new())
            }
            ChannelStatus::Active => self.try_commit(m).await,
            ChannelStatus::Overriding => {
                self.finalize_override(m).await?;
                Ok(Vec::new())
            }
            other => {
                debug!(peer = %self.peer_hex(), status = %other, "Ignoring StateUpdate");
                Ok(Vec::new())
            }
        }
    }

    /// Host side: the client countersigned the initial state
    async fn finalize_opening(&mut self, m: StateUpdate) -> Result<(), ChannelError> {
        let refund = match self.opening_refund_script.clone() {
            Some(refund) => refund,
            None => return Ok(()),
        };
        let today = block_day(self.current_height);
        if m.block_day.abs_diff(today) > 1 {
            let error = ErrorMessage::coded(
                self.channel_id(),
                ERR_HOSTED_WRONG_BLOCKDAY,
                "initial state blockday too far off",
            );
            self.send(HostedMessage::Error(error)).await?;
            self.opening_refund_script = None;
            return Ok(());
        }
        if m.local_updates != 0 || m.remote_updates != 0 {
            debug!(peer = %self.peer_hex(), "Initial StateUpdate with nonzero counters");
            return Ok(());
        }
        let init = self.ctx.config.init_hosted_channel();
        let mut lcss = LastCrossSignedState {
            is_host: true,
            refund_script_pub_key: refund,
            block_day: m.block_day,
            local_balance_msat: init.channel_capacity_msat - init.initial_client_balance_msat,
            remote_balance_msat: init.initial_client_balance_msat,
            init_hosted_channel: init,
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: Vec::new(),
            outgoing_htlcs: Vec::new(),
            remote_sig_of_local: m.local_sig_of_remote_lcss,
            local_sig_of_remote: Signature64::ZERO,
        };
        if !lcss.verify_remote_sig(&self.ctx.secp, &self.peer) {
            let error = ErrorMessage::coded(
                self.channel_id(),
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "initial state signature does not verify",
            );
            self.send(HostedMessage::Error(error)).await?;
            self.opening_refund_script = None;
            return Ok(());
        }
        lcss.local_sig_of_remote =
            lcss.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());

        self.record.lcss = Some(lcss.clone());
        self.opening_refund_script = None;
        self.persist_record()?;
        info!(peer = %self.peer_hex(), "Hosted channel opened (as host)");

        self.send(HostedMessage::StateUpdate(lcss.state_update()))
            .await?;
        self.send(HostedMessage::ChannelUpdate(self.channel_update()))
            .await?;
        Ok(())
    }

    /// Client side: the host countersigned our initial state
    async fn finalize_invoking(&mut self, m: StateUpdate) -> Result<(), ChannelError> {
        let mut lcss = match self.invoking_lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(()),
        };
        let today = block_day(self.current_height);
        if m.block_day.abs_diff(today) > 1 {
            let error = ErrorMessage::coded(
                self.channel_id(),
                ERR_HOSTED_WRONG_BLOCKDAY,
                "initial state blockday too far off",
            );
            self.send(HostedMessage::Error(error)).await?;
            self.invoking_lcss = None;
            return Ok(());
        }
        let day_changed = lcss.block_day != m.block_day;
        lcss.block_day = m.block_day;
        lcss.remote_sig_of_local = m.local_sig_of_remote_lcss;
        if day_changed {
            lcss.local_sig_of_remote =
                lcss.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());
        }
        if !lcss.verify_remote_sig(&self.ctx.secp, &self.peer) {
            let error = ErrorMessage::coded(
                self.channel_id(),
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "host signature does not verify",
            );
            self.send(HostedMessage::Error(error)).await?;
            self.invoking_lcss = None;
            return Ok(());
        }

        self.record.lcss = Some(lcss.clone());
        self.invoking_lcss = None;
        self.persist_record()?;
        info!(peer = %self.peer_hex(), "Hosted channel opened (as client)");

        if day_changed {
            self.send(HostedMessage::StateUpdate(lcss.state_update()))
                .await?;
        }
        self.send(HostedMessage::ChannelUpdate(self.channel_update()))
            .await?;
        Ok(())
    }

    /// Active path: the peer signed our pending state
    async fn try_commit(&mut self, m: StateUpdate) -> Result<Vec<ChannelAction>, ChannelError> {
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(Vec::new()),
        };
        let covered_len = self.queue.len();
        let mut next = self.queue.next_state(&committed);
        let today = block_day(self.current_height);
        next.block_day = today;

        if m.block_day != today {
            debug!(
                peer = %self.peer_hex(),
                theirs = m.block_day,
                ours = today,
                "StateUpdate for a different blockday"
            );
            return Ok(Vec::new());
        }
        if m.local_updates != next.remote_updates || m.remote_updates != next.local_updates {
            debug!(
                peer = %self.peer_hex(),
                msg_local = m.local_updates,
                msg_remote = m.remote_updates,
                next_local = next.local_updates,
                next_remote = next.remote_updates,
                "StateUpdate counters diverge, waiting for the next exchange"
            );
            return Ok(Vec::new());
        }
        next.remote_sig_of_local = m.local_sig_of_remote_lcss;
        if !next.verify_remote_sig(&self.ctx.secp, &self.peer) {
            let error = self.record_local_error(
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "state update signature does not verify",
                None,
            )?;
            let _ = self.send(HostedMessage::Error(error)).await;
            return Ok(Vec::new());
        }
        next.local_sig_of_remote =
            next.sign_mirrored(&self.ctx.secp, &self.ctx.upstream.node_secret());

        // one checkpoint: new state, forward-table pruning for resolved
        // outgoing HTLCs, and forward entries for our committed adds
        let covered: Vec<_> = self.queue.iter().take(covered_len).cloned().collect();
        let our_scid = self.short_channel_id();
        let prev = committed;
        self.record.lcss = Some(next.clone());
        {
            let peer_hex = self.peer_hex();
            let record = self.record.clone();
            let next_for_store = next.clone();
            let prev_for_store = prev.clone();
            let covered_for_store = covered.clone();
            self.ctx.store.update(move |data| {
                data.channels.insert(peer_hex, record);
                data.htlc_forwards.retain(|_, out| {
                    !(out.short_channel_id == our_scid
                        && prev_for_store.outgoing_htlc(out.htlc_id).is_some()
                        && next_for_store.outgoing_htlc(out.htlc_id).is_none())
                });
                for update in &covered_for_store {
                    if let (
                        UpdateOrigin::Local {
                            forwarded_from: Some(incoming),
                        },
                        UpdateMessage::Add(add),
                    ) = (&update.origin, &update.message)
                    {
                        data.htlc_forwards
                            .insert(*incoming, HtlcIdentifier::new(our_scid, add.id));
                    }
                }
            })?;
        }
        self.ctx.store.gc_preimages()?;
        debug!(
            peer = %self.peer_hex(),
            local_updates = next.local_updates,
            remote_updates = next.remote_updates,
            "State committed"
        );

        // act on what just became irreversible
        let mut actions = Vec::new();
        let mut deferred_fails = Vec::new();
        for update in &covered {
            match (&update.origin, &update.message) {
                (UpdateOrigin::Remote, UpdateMessage::Fail(f)) => {
                    self.resolve(f.id, HtlcResolution::FailOnion(f.reason.clone()));
                }
                (UpdateOrigin::Remote, UpdateMessage::FailMalformed(f)) => {
                    self.resolve(f.id, HtlcResolution::Fail(FailureMessage::InvalidOnionPayload));
                }
                (UpdateOrigin::Remote, UpdateMessage::Fulfill(_)) => {
                    // already resolved eagerly on receipt
                }
                (UpdateOrigin::Remote, UpdateMessage::Add(add)) => {
                    if let Some(failure) = self.failed_adds.remove(&add.id) {
                        deferred_fails.push((add.id, failure));
                    } else if let Some((relay, next_onion)) = self.peeled_adds.remove(&add.id) {
                        actions.push(ChannelAction::Forward(ForwardCmd {
                            incoming: HtlcIdentifier::new(our_scid, add.id),
                            amount_msat: add.amount_msat,
                            payment_hash: add.payment_hash,
                            relay,
                            next_onion,
                        }));
                    } else {
                        warn!(peer = %self.peer_hex(), htlc_id = add.id, "Committed remote add without peel result");
                    }
                }
                (UpdateOrigin::Local { .. }, _) => {
                    // sends happened at origination, forward-table entries
                    // in the checkpoint above
                }
            }
        }

        self.queue.drain_first(covered_len);
        self.send_state_update().await?;

        // settled incoming HTLCs no longer need their onion secrets
        let still_needed: HashSet<u64> = next
            .incoming_htlcs
            .iter()
            .map(|h| h.id)
            .chain(self.queue.iter().map(|u| u.message.htlc_id()))
            .collect();
        self.incoming_secrets.retain(|id, _| still_needed.contains(id));

        for (id, failure) in deferred_fails {
            self.got_payment_result(id, Some(Err(OutgoingFailure::Message(failure))))
                .await?;
        }
        Ok(actions)
    }

    /// Overriding path: the client countersigned our override proposal
    async fn finalize_override(&mut self, m: StateUpdate) -> Result<(), ChannelError> {
        let mut proposal = match self.record.proposed_override.clone() {
            Some(proposal) => proposal,
            None => return Ok(()),
        };
        if m.block_day != proposal.block_day
            || m.local_updates != proposal.remote_updates
            || m.remote_updates != proposal.local_updates
        {
            debug!(peer = %self.peer_hex(), "StateUpdate does not match proposed override");
            return Ok(());
        }
        proposal.remote_sig_of_local = m.local_sig_of_remote_lcss;
        if !proposal.verify_remote_sig(&self.ctx.secp, &self.peer) {
            let error = self.record_local_error(
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "override signature does not verify",
                None,
            )?;
            let _ = self.send(HostedMessage::Error(error)).await;
            return Ok(());
        }

        self.record.lcss = Some(proposal);
        self.record.proposed_override = None;
        self.record.local_errors.clear();
        self.record.remote_errors.clear();
        self.record.suspended = false;
        self.persist_record()?;
        self.queue = UpdateQueue::new();
        self.peeled_adds.clear();
        self.failed_adds.clear();
        self.incoming_secrets.clear();
        info!(peer = %self.peer_hex(), "Override accepted, channel active again");

        self.send(HostedMessage::ChannelUpdate(self.channel_update()))
            .await?;
        Ok(())
    }

    /// The peer offers us an HTLC
    async fn on_remote_add(&mut self, add: UpdateAddHtlc) -> Result<(), ChannelError> {
        if self.status() != ChannelStatus::Active {
            debug!(peer = %self.peer_hex(), status = %self.status(), "Ignoring remote add");
            return Ok(());
        }
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(()),
        };

        // tentative: the add enters the queue before any verdict
        self.queue
            .push(UpdateOrigin::Remote, UpdateMessage::Add(add.clone()));

        match self.ctx.onion.peel(
            &self.ctx.upstream.node_secret(),
            add.payment_hash.as_bytes(),
            &add.onion_routing_packet,
        ) {
            Err(OnionError::Malformed { .. }) => {
                return self.suspend_channel("unparseable onion", add).await;
            }
            Err(OnionError::Failure(failure)) => {
                self.failed_adds.insert(add.id, failure);
            }
            Ok(peeled) => {
                self.incoming_secrets.insert(add.id, peeled.shared_secret);
                match peeled.payload {
                    PeeledPayload::Relay(relay) => {
                        if add.amount_msat < relay.amount_to_forward_msat {
                            return self.suspend_channel("negative forwarding fee", add).await;
                        }
                        self.peeled_adds.insert(add.id, (relay, peeled.next_onion));
                    }
                    PeeledPayload::Final(_) => {
                        // we forward, we do not receive
                        self.failed_adds
                            .insert(add.id, FailureMessage::TemporaryNodeFailure);
                    }
                }
            }
        }

        let params = &committed.init_hosted_channel;
        let next = self.queue.next_state(&committed);
        if next.incoming_htlcs.len() > params.max_accepted_htlcs as usize {
            return self.suspend_channel("too many incoming HTLCs", add).await;
        }
        let in_flight: u64 = next.incoming_htlcs.iter().map(|h| h.amount_msat).sum();
        if in_flight > params.max_htlc_value_in_flight_msat {
            return self
                .suspend_channel("incoming HTLC value in flight exceeded", add)
                .await;
        }
        if self.queue.would_overdraw(&committed, 0, 0) {
            return self.suspend_channel("balance overdrawn", add).await;
        }

        if add.amount_msat < params.htlc_minimum_msat {
            self.peeled_adds.remove(&add.id);
            self.failed_adds
                .insert(add.id, FailureMessage::TemporaryChannelFailure);
        }
        Ok(())
    }

    /// Critical misbehavior around a remote add: drop it, record the error,
    /// notify the peer
    async fn suspend_channel(
        &mut self,
        reason: &str,
        add: UpdateAddHtlc,
    ) -> Result<(), ChannelError> {
        self.queue
            .remove_last_where(|u| matches!(&u.message, UpdateMessage::Add(a) if a.id == add.id));
        self.peeled_adds.remove(&add.id);
        self.failed_adds.remove(&add.id);
        self.incoming_secrets.remove(&add.id);
        let error = self.record_local_error(ERR_HOSTED_MANUAL_SUSPEND, reason, Some(add))?;
        if let Err(e) = self.send(HostedMessage::Error(error)).await {
            warn!(peer = %self.peer_hex(), error = %e, "Error send failed");
        }
        Ok(())
    }

    /// The peer settles one of our outgoing HTLCs
    async fn on_remote_fulfill(&mut self, m: UpdateFulfillHtlc) -> Result<(), ChannelError> {
        if self.status() != ChannelStatus::Active {
            debug!(peer = %self.peer_hex(), "Ignoring fulfill while not active");
            return Ok(());
        }
        let committed = match self.record.lcss.clone() {
            Some(lcss) => lcss,
            None => return Ok(()),
        };
        let next = self.queue.next_state(&committed);
        let outgoing = match next.outgoing_htlc(m.id) {
            Some(htlc) => htlc.clone(),
            None => {
                warn!(peer = %self.peer_hex(), htlc_id = m.id, "Fulfill for unknown outgoing HTLC");
                return Ok(());
            }
        };
        if !m.payment_preimage.matches(&outgoing.payment_hash) {
            warn!(peer = %self.peer_hex(), htlc_id = m.id, "Fulfill with wrong preimage");
            return Ok(());
        }
        // resolve upstream right away so our inbound can be claimed; the
        // cross-signed commit follows
        self.resolve(m.id, HtlcResolution::Fulfill(m.payment_preimage));
        self.queue
            .push(UpdateOrigin::Remote, UpdateMessage::Fulfill(m));
        Ok(())
    }

    async fn on_remote_fail(&mut self, m: UpdateFailHtlc) -> Result<(), ChannelError> {
        if self.status() != ChannelStatus::Active {
            debug!(peer = %self.peer_hex(), "Ignoring fail while not active");
            return Ok(());
        }
        if m.reason.is_empty() {
            let error = self.record_local_error(
                ERR_HOSTED_WRONG_REMOTE_SIG,
                "peer failed an HTLC with an empty reason",
                None,
            )?;
            let _ = self.send(HostedMessage::Error(error)).await;
            return Ok(());
        }
        self.queue.push(UpdateOrigin::Remote, UpdateMessage::Fail(m));
        Ok(())
    }

    async fn on_remote_error(&mut self, m: ErrorMessage) -> Result<(), ChannelError> {
        warn!(peer = %self.peer_hex(), error = %m.description(), "Peer sent channel error");
        if !self.record.remote_errors.contains(&m) {
            self.record.remote_errors.push(m);
        }
        if self.record.local_errors.is_empty() {
            // marks the channel errored; nothing is sent back
            self.record_local_error(
                ERR_HOSTED_CLOSED_BY_REMOTE_PEER,
                "channel closed by remote peer",
                None,
            )?;
        } else {
            self.persist_record()?;
        }
        Ok(())
    }
}

/// Witness program script from a bech32 address, used as the refund script
/// when we request a channel as a client
fn refund_script_from_address(address: &str) -> Result<Vec<u8>, ChannelError> {
    use bech32::FromBase32;
    let (_hrp, data, _variant) = bech32::decode(address)
        .map_err(|e| ChannelError::InvalidRefundAddress(format!("{address}: {e}")))?;
    if data.is_empty() {
        return Err(ChannelError::InvalidRefundAddress(address.to_string()));
    }
    let version = data[0].to_u8();
    let program = Vec::<u8>::from_base32(&data[1..])
        .map_err(|e| ChannelError::InvalidRefundAddress(format!("{address}: {e}")))?;
    if version > 16 || program.len() < 2 || program.len() > 40 {
        return Err(ChannelError::InvalidRefundAddress(address.to_string()));
    }
    let mut script = Vec::with_capacity(program.len() + 2);
    // OP_0 or OP_1..OP_16, then the push of the program
    script.push(if version == 0 { 0x00 } else { 0x50 + version });
    script.push(program.len() as u8);
    script.extend_from_slice(&program);
    Ok(script)
}
