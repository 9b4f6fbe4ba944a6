//! Channel master
//!
//! Owns every hosted channel, demultiplexes upstream events by peer, polls
//! the chain tip, replays hosted-to-hosted forwards after a restart, and
//! exposes the operations the RPC front-end calls. Channels never talk to
//! each other directly: forwards surface as commands that the master routes
//! either into another hosted channel or out through the upstream node.

use crate::channel::{
    ChannelAction, ChannelContext, ChannelError, ForwardCmd, HostedChannel, HtlcResolution,
    OutgoingFailure, OutgoingResult,
};
use crate::config::HostedConfig;
use crate::onion::{FailureMessage, OnionHandler, PeeledPayload};
use crate::store::Store;
use crate::types::{HtlcIdentifier, PaymentHash, ShortChannelId};
use crate::upstream::{OutgoingStatus, UpstreamError, UpstreamEvent, UpstreamNode};
use crate::wire::HostedMessage;
use secp256k1::PublicKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// How often the chain tip is polled
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period before hosted-to-hosted forwards are replayed at startup
pub const STARTUP_REPLAY_DELAY: Duration = Duration::from_secs(10);

/// Delay before chasing incoming HTLC resolutions after a reconnect
pub const RECONNECT_RESYNC_DELAY: Duration = Duration::from_secs(3);

/// Bounded re-inspection of payments reported as still pending
pub const PENDING_INSPECT_RETRIES: usize = 5;
pub const PENDING_INSPECT_INTERVAL: Duration = Duration::from_secs(1);

/// One row of the channel listing served to the front-end
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub peer_id: String,
    pub status: String,
    pub short_channel_id: String,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub incoming_htlcs: usize,
    pub outgoing_htlcs: usize,
}

/// Detailed view of one channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    #[serde(flatten)]
    pub summary: ChannelSummary,
    pub local_errors: Vec<String>,
    pub remote_errors: Vec<String>,
    pub last_cross_signed_state_hex: Option<String>,
}

/// Genesis hash of the named network, in the wire byte order
fn chain_hash_for_network(name: &str) -> Result<[u8; 32], UpstreamError> {
    let hash_hex = match name {
        "bitcoin" | "mainnet" => {
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        }
        "testnet" | "testnet3" => {
            "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000"
        }
        "signet" => "f61eee3b63a380a477a063af32b2bbc97c9ff9f01f2c4225e973988108000000",
        "regtest" => "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f",
        other => return Err(UpstreamError::UnsupportedNetwork(other.to_string())),
    };
    let bytes = hex::decode(hash_hex).expect("static genesis hex");
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Owner and multiplexer of all hosted channels
pub struct ChannelMaster {
    ctx: Arc<ChannelContext>,
    channels: RwLock<HashMap<PublicKey, Arc<Mutex<HostedChannel>>>>,
    current_height: AtomicU32,

    /// Back-reference for handing owned clones to spawned tasks
    self_ref: Weak<ChannelMaster>,
}

impl ChannelMaster {
    /// Build the master once the upstream RPC is reachable: resolves the
    /// chain hash by network name and reads the first chain tip
    pub async fn new(
        config: Arc<HostedConfig>,
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamNode>,
        onion: Arc<dyn OnionHandler>,
    ) -> Result<Arc<Self>, ChannelError> {
        let network = upstream.network().await?;
        let chain_hash = chain_hash_for_network(&network)?;
        let height = upstream.block_height().await?;
        info!(network, height, "Channel master starting");
        let ctx = Arc::new(ChannelContext::new(
            config, store, upstream, onion, chain_hash,
        ));
        Ok(Arc::new_cyclic(|self_ref| Self {
            ctx,
            channels: RwLock::new(HashMap::new()),
            current_height: AtomicU32::new(height),
            self_ref: self_ref.clone(),
        }))
    }

    fn strong(&self) -> Arc<ChannelMaster> {
        self.self_ref.upgrade().expect("master is owned by an Arc")
    }

    pub fn current_height(&self) -> u32 {
        self.current_height.load(Ordering::SeqCst)
    }

    pub fn chain_hash(&self) -> [u8; 32] {
        self.ctx.chain_hash
    }

    /// Materialize persisted channels and spawn the background tasks:
    /// the one-minute block poll and the delayed forward replay
    pub async fn start(&self) {
        let snapshot = self.ctx.store.snapshot();
        for peer_hex in snapshot.channels.keys() {
            match hex::decode(peer_hex)
                .ok()
                .and_then(|raw| PublicKey::from_slice(&raw).ok())
            {
                Some(peer) => {
                    self.channel(peer).await;
                }
                None => warn!(peer = %peer_hex, "Unparseable peer key in store"),
            }
        }

        let master = self.strong();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
                match master.ctx.upstream.block_height().await {
                    Ok(height) if height != master.current_height() => {
                        master.on_block_updated(height).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Block poll failed"),
                }
            }
        });

        let master = self.strong();
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_REPLAY_DELAY).await;
            master.replay_hosted_forwards().await;
        });
    }

    /// The channel for `peer`, created lazily on first contact
    pub async fn channel(&self, peer: PublicKey) -> Arc<Mutex<HostedChannel>> {
        let mut channels = self.channels.write().await;
        channels
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(Mutex::new(HostedChannel::new(
                    peer,
                    Arc::clone(&self.ctx),
                    self.current_height.load(Ordering::SeqCst),
                )))
            })
            .clone()
    }

    /// Find the hosted channel owning a short channel id, if any
    pub async fn channel_by_scid(
        &self,
        scid: ShortChannelId,
    ) -> Option<(PublicKey, Arc<Mutex<HostedChannel>>)> {
        let our_id = self.ctx.upstream.node_id();
        let channels = self.channels.read().await;
        channels
            .iter()
            .find(|(peer, _)| ShortChannelId::from_peers(&our_id, peer) == scid)
            .map(|(peer, cell)| (*peer, cell.clone()))
    }

    /// Fan a new chain tip out to every channel
    pub async fn on_block_updated(&self, height: u32) {
        self.current_height.store(height, Ordering::SeqCst);
        debug!(height, "Block update");
        let channels: Vec<_> = self.channels.read().await.values().cloned().collect();
        for cell in channels {
            if let Err(e) = cell.lock().await.on_block_updated(height).await {
                warn!(error = %e, "Block update failed for channel");
            }
        }
    }

    /// Single entry point for upstream events
    ///
    /// `HtlcAccepted` returns the resolution receiver the front-end must
    /// await to answer the hook; every other event returns `None`.
    pub async fn handle_event(
        &self,
        event: UpstreamEvent,
    ) -> Result<Option<oneshot::Receiver<HtlcResolution>>, ChannelError> {
        match event {
            UpstreamEvent::CustomMessage { peer, frame } => {
                let msg = match HostedMessage::decode_frame(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Undecodable custom message");
                        return Ok(None);
                    }
                };
                let cell = self.channel(peer).await;
                let actions = cell.lock().await.on_peer_message(msg).await?;
                self.dispatch_actions(peer, actions).await;
                Ok(None)
            }
            UpstreamEvent::HtlcAccepted {
                incoming,
                payment_hash,
                amount_msat,
                cltv_expiry: _,
                outgoing_channel,
                amount_to_forward_msat,
                outgoing_cltv,
                next_onion,
            } => {
                let (_, cell) = match self.channel_by_scid(outgoing_channel).await {
                    Some(found) => found,
                    None => return Ok(None),
                };
                let rx = cell
                    .lock()
                    .await
                    .add_htlc(
                        incoming,
                        amount_msat,
                        amount_to_forward_msat,
                        payment_hash,
                        outgoing_cltv,
                        next_onion,
                    )
                    .await;
                Ok(Some(rx))
            }
            UpstreamEvent::SendpaySuccess {
                label,
                payment_hash: _,
                preimage,
            } => {
                self.feed_payment_result(label, Ok(preimage)).await;
                Ok(None)
            }
            UpstreamEvent::SendpayFailure {
                label,
                payment_hash,
                failure_onion,
                still_pending,
            } => {
                if still_pending {
                    let master = self.strong();
                    tokio::spawn(async move {
                        master.chase_pending_payment(label, payment_hash).await;
                    });
                } else {
                    let failure = match failure_onion {
                        Some(onion) => OutgoingFailure::Onion(onion),
                        None => OutgoingFailure::Message(FailureMessage::TemporaryChannelFailure),
                    };
                    self.feed_payment_result(label, Err(failure)).await;
                }
                Ok(None)
            }
            UpstreamEvent::Connected(peer) => {
                debug!(peer = %peer, "Peer connected");
                Ok(None)
            }
            UpstreamEvent::Disconnected(peer) => {
                debug!(peer = %peer, "Peer disconnected");
                Ok(None)
            }
        }
    }

    /// Deliver an outgoing-payment outcome to the channel that forwarded it
    async fn feed_payment_result(&self, label: HtlcIdentifier, result: OutgoingResult) {
        let cell = match self.channel_by_scid(label.short_channel_id).await {
            Some((_, cell)) => cell,
            None => {
                debug!(%label, "Payment result for unknown channel");
                return;
            }
        };
        let outcome = cell
            .lock()
            .await
            .got_payment_result(label.htlc_id, Some(result))
            .await;
        if let Err(e) = outcome {
            warn!(%label, error = %e, "Payment result handling failed");
        }
    }

    /// A sendpay failure claimed the payment is still pending: re-inspect a
    /// bounded number of times instead of polling forever
    async fn chase_pending_payment(&self, label: HtlcIdentifier, payment_hash: PaymentHash) {
        for _ in 0..PENDING_INSPECT_RETRIES {
            tokio::time::sleep(PENDING_INSPECT_INTERVAL).await;
            match self
                .ctx
                .upstream
                .inspect_outgoing_payment(label, payment_hash)
                .await
            {
                Ok(OutgoingStatus::Pending) => continue,
                Ok(OutgoingStatus::Complete(preimage)) => {
                    self.feed_payment_result(label, Ok(preimage)).await;
                    return;
                }
                Ok(OutgoingStatus::Failed(onion)) => {
                    let failure = match onion {
                        Some(onion) => OutgoingFailure::Onion(onion),
                        None => OutgoingFailure::Message(FailureMessage::TemporaryChannelFailure),
                    };
                    self.feed_payment_result(label, Err(failure)).await;
                    return;
                }
                Err(e) => {
                    warn!(%label, error = %e, "Pending payment inspection failed");
                    return;
                }
            }
        }
        debug!(%label, "Gave up chasing pending payment until next reconnect");
    }

    async fn dispatch_actions(&self, source_peer: PublicKey, actions: Vec<ChannelAction>) {
        for action in actions {
            match action {
                ChannelAction::Forward(cmd) => self.dispatch_forward(source_peer, cmd).await,
                ChannelAction::ResyncIncoming => {
                    let master = self.strong();
                    tokio::spawn(async move {
                        tokio::time::sleep(RECONNECT_RESYNC_DELAY).await;
                        master.resync_channel(source_peer).await;
                    });
                }
            }
        }
    }

    /// Route a committed remote add: into another hosted channel if the
    /// outgoing scid is ours, out through the upstream node otherwise
    async fn dispatch_forward(&self, source_peer: PublicKey, cmd: ForwardCmd) {
        if let Some((_, target)) = self.channel_by_scid(cmd.relay.outgoing_channel).await {
            let rx = target
                .lock()
                .await
                .add_htlc(
                    cmd.incoming,
                    cmd.amount_msat,
                    cmd.relay.amount_to_forward_msat,
                    cmd.payment_hash,
                    cmd.relay.outgoing_cltv,
                    cmd.next_onion,
                )
                .await;
            self.bind_forward_result(source_peer, cmd.incoming, rx);
        } else {
            let sent = self
                .ctx
                .upstream
                .send_onion(
                    cmd.incoming,
                    cmd.relay.outgoing_channel,
                    cmd.relay.amount_to_forward_msat,
                    cmd.relay.outgoing_cltv,
                    cmd.payment_hash,
                    cmd.next_onion,
                )
                .await;
            if let Err(e) = sent {
                warn!(incoming = %cmd.incoming, error = %e, "Upstream forward failed");
                self.feed_payment_result(
                    cmd.incoming,
                    Err(OutgoingFailure::Message(
                        FailureMessage::TemporaryChannelFailure,
                    )),
                )
                .await;
            }
        }
    }

    /// When the hosted target resolves, settle the hosted source
    fn bind_forward_result(
        &self,
        source_peer: PublicKey,
        incoming: HtlcIdentifier,
        rx: oneshot::Receiver<HtlcResolution>,
    ) {
        let master = self.strong();
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(HtlcResolution::Fulfill(preimage)) => Ok(preimage),
                Ok(HtlcResolution::Fail(msg)) => Err(OutgoingFailure::Message(msg)),
                Ok(HtlcResolution::FailOnion(onion)) => Err(OutgoingFailure::Onion(onion)),
                Err(_) => Err(OutgoingFailure::Message(
                    FailureMessage::TemporaryChannelFailure,
                )),
            };
            let cell = match master.channels.read().await.get(&source_peer).cloned() {
                Some(cell) => cell,
                None => return,
            };
            let outcome = cell
                .lock()
                .await
                .got_payment_result(incoming.htlc_id, Some(result))
                .await;
            if let Err(e) = outcome {
                warn!(%incoming, error = %e, "Forward result handling failed");
            }
        });
    }

    /// Reconstruct in-flight hosted-to-hosted forwards from the forwarding
    /// table after a restart
    async fn replay_hosted_forwards(&self) {
        let forwards = self.ctx.store.snapshot().htlc_forwards;
        for (incoming, outgoing) in forwards {
            let (source_peer, source) = match self.channel_by_scid(incoming.short_channel_id).await
            {
                Some(found) => found,
                None => continue,
            };
            if self.channel_by_scid(outgoing.short_channel_id).await.is_none() {
                // outgoing leg went through the upstream node; reconnect
                // inspection covers it
                continue;
            }
            let htlc = {
                let guard = source.lock().await;
                guard
                    .record()
                    .lcss
                    .as_ref()
                    .and_then(|lcss| lcss.incoming_htlc(incoming.htlc_id).cloned())
            };
            let htlc = match htlc {
                Some(htlc) => htlc,
                None => continue,
            };
            let peeled = match self.ctx.onion.peel(
                &self.ctx.upstream.node_secret(),
                htlc.payment_hash.as_bytes(),
                &htlc.onion_routing_packet,
            ) {
                Ok(peeled) => peeled,
                Err(e) => {
                    warn!(%incoming, error = %e, "Cannot re-peel onion for forward replay");
                    continue;
                }
            };
            let relay = match peeled.payload {
                PeeledPayload::Relay(relay) => relay,
                PeeledPayload::Final(_) => continue,
            };
            let (_, target) = match self.channel_by_scid(relay.outgoing_channel).await {
                Some(found) => found,
                None => continue,
            };
            info!(%incoming, %outgoing, "Replaying hosted-to-hosted forward");
            let rx = target
                .lock()
                .await
                .add_htlc(
                    incoming,
                    htlc.amount_msat,
                    relay.amount_to_forward_msat,
                    htlc.payment_hash,
                    relay.outgoing_cltv,
                    peeled.next_onion,
                )
                .await;
            self.bind_forward_result(source_peer, incoming, rx);
        }
    }

    /// Chase resolutions for one channel's committed incoming HTLCs
    async fn resync_channel(&self, peer: PublicKey) {
        let cell = match self.channels.read().await.get(&peer).cloned() {
            Some(cell) => cell,
            None => return,
        };
        let items = match cell.lock().await.resync_incoming().await {
            Ok(items) => items,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Resync failed");
                return;
            }
        };
        for item in items {
            if item.forwarded_to.is_some() {
                // hosted outgoing leg, the target channel resolves it
                continue;
            }
            match self
                .ctx
                .upstream
                .inspect_outgoing_payment(item.incoming, item.payment_hash)
                .await
            {
                Ok(OutgoingStatus::Pending) => {}
                Ok(OutgoingStatus::Complete(preimage)) => {
                    self.feed_payment_result(item.incoming, Ok(preimage)).await;
                }
                Ok(OutgoingStatus::Failed(onion)) => {
                    let failure = match onion {
                        Some(onion) => OutgoingFailure::Onion(onion),
                        None => OutgoingFailure::Message(FailureMessage::TemporaryChannelFailure),
                    };
                    self.feed_payment_result(item.incoming, Err(failure)).await;
                }
                Err(e) => warn!(incoming = %item.incoming, error = %e, "Inspection failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Front-end operations
    // ------------------------------------------------------------------

    pub async fn list_channels(&self) -> Vec<ChannelSummary> {
        let channels: Vec<_> = self.channels.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(channels.len());
        for cell in channels {
            let guard = cell.lock().await;
            summaries.push(summarize(&guard));
        }
        summaries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        summaries
    }

    pub async fn channel_info(&self, peer: PublicKey) -> Option<ChannelInfo> {
        let cell = self.channels.read().await.get(&peer).cloned()?;
        let guard = cell.lock().await;
        let record = guard.record();
        Some(ChannelInfo {
            summary: summarize(&guard),
            local_errors: record
                .local_errors
                .iter()
                .map(|e| e.error.description())
                .collect(),
            remote_errors: record.remote_errors.iter().map(|e| e.description()).collect(),
            last_cross_signed_state_hex: record.lcss.as_ref().map(|l| hex::encode(l.to_bytes())),
        })
    }

    pub async fn propose_override(
        &self,
        peer: PublicKey,
        new_local_balance_msat: u64,
    ) -> Result<(), ChannelError> {
        let cell = self.channel(peer).await;
        let mut guard = cell.lock().await;
        guard.propose_override(new_local_balance_msat).await
    }

    pub async fn request_channel(&self, peer: PublicKey) -> Result<(), ChannelError> {
        let cell = self.channel(peer).await;
        let mut guard = cell.lock().await;
        guard.request_hosted_channel().await
    }

    /// Add a one-shot invocation secret; returns false if it was already
    /// present
    pub fn add_secret(&self, secret_hex: &str) -> Result<bool, ChannelError> {
        let secret = hex::decode(secret_hex)
            .map_err(|_| ChannelError::InvalidState(format!("invalid secret: {secret_hex}")))?;
        Ok(self
            .ctx
            .temporary_secrets
            .lock()
            .expect("secrets lock")
            .insert(secret))
    }

    /// Remove a one-shot invocation secret; returns false if absent
    pub fn remove_secret(&self, secret_hex: &str) -> Result<bool, ChannelError> {
        let secret = hex::decode(secret_hex)
            .map_err(|_| ChannelError::InvalidState(format!("invalid secret: {secret_hex}")))?;
        Ok(self
            .ctx
            .temporary_secrets
            .lock()
            .expect("secrets lock")
            .remove(&secret))
    }
}

fn summarize(channel: &HostedChannel) -> ChannelSummary {
    let lcss = channel.record().lcss.as_ref();
    ChannelSummary {
        peer_id: channel.peer_hex(),
        status: channel.status().to_string(),
        short_channel_id: channel.short_channel_id().to_string(),
        local_balance_msat: lcss.map(|l| l.local_balance_msat).unwrap_or(0),
        remote_balance_msat: lcss.map(|l| l.remote_balance_msat).unwrap_or(0),
        incoming_htlcs: lcss.map(|l| l.incoming_htlcs.len()).unwrap_or(0),
        outgoing_htlcs: lcss.map(|l| l.outgoing_htlcs.len()).unwrap_or(0),
    }
}
