//! Shared fixtures: a scripted upstream node and a deterministic onion
//! handler, so channel scenarios run without a real Lightning node.

#![allow(dead_code)]

use async_trait::async_trait;
use hclib::channel::{ChannelContext, HostedChannel};
use hclib::config::HostedConfig;
use hclib::lcss::LastCrossSignedState;
use hclib::onion::{
    FailureMessage, FinalPayload, OnionError, OnionHandler, PeeledOnion, PeeledPayload,
    RelayPayload,
};
use hclib::store::Store;
use hclib::types::{block_day, HtlcIdentifier, PaymentHash, PaymentPreimage, ShortChannelId};
use hclib::upstream::{OutgoingStatus, UpstreamError, UpstreamNode};
use hclib::wire::{HostedMessage, InvokeHostedChannel, Signature64, StateUpdate};
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const START_HEIGHT: u32 = 800_000;

pub fn keypair(seed: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed.max(1); 32]).expect("valid secret key");
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

pub fn refund_script() -> Vec<u8> {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[0xab; 20]);
    script
}

/// Upstream node double recording every outbound call
pub struct MockUpstream {
    secret: SecretKey,
    node_id: PublicKey,
    pub height: AtomicU32,
    pub fail_sends: AtomicBool,
    pub sent_frames: Mutex<Vec<(PublicKey, Vec<u8>)>>,
    pub sent_onions: Mutex<Vec<(HtlcIdentifier, ShortChannelId, u64, u32, PaymentHash)>>,
    pub inspect_result: Mutex<OutgoingStatus>,
}

impl MockUpstream {
    pub fn new(seed: u8) -> Self {
        let (secret, node_id) = keypair(seed);
        Self {
            secret,
            node_id,
            height: AtomicU32::new(START_HEIGHT),
            fail_sends: AtomicBool::new(false),
            sent_frames: Mutex::new(Vec::new()),
            sent_onions: Mutex::new(Vec::new()),
            inspect_result: Mutex::new(OutgoingStatus::Pending),
        }
    }

    /// Drain and decode everything sent to peers so far
    pub fn take_messages(&self) -> Vec<HostedMessage> {
        self.take_messages_with_peers()
            .into_iter()
            .map(|(_, msg)| msg)
            .collect()
    }

    /// Like `take_messages`, keeping the peer each frame went to
    pub fn take_messages_with_peers(&self) -> Vec<(PublicKey, HostedMessage)> {
        self.sent_frames
            .lock()
            .unwrap()
            .drain(..)
            .map(|(peer, frame)| {
                (
                    peer,
                    HostedMessage::decode_frame(&frame).expect("sent frames decode"),
                )
            })
            .collect()
    }
}

#[async_trait]
impl UpstreamNode for MockUpstream {
    async fn network(&self) -> Result<String, UpstreamError> {
        Ok("regtest".to_string())
    }

    async fn block_height(&self) -> Result<u32, UpstreamError> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    fn node_id(&self) -> PublicKey {
        self.node_id
    }

    fn node_secret(&self) -> SecretKey {
        self.secret
    }

    async fn send_custom_message(
        &self,
        peer: &PublicKey,
        frame: Vec<u8>,
    ) -> Result<(), UpstreamError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(UpstreamError::PeerNotConnected(peer.to_string()));
        }
        self.sent_frames.lock().unwrap().push((*peer, frame));
        Ok(())
    }

    async fn send_onion(
        &self,
        label: HtlcIdentifier,
        outgoing_channel: ShortChannelId,
        amount_msat: u64,
        cltv_expiry: u32,
        payment_hash: PaymentHash,
        _onion: Vec<u8>,
    ) -> Result<(), UpstreamError> {
        self.sent_onions.lock().unwrap().push((
            label,
            outgoing_channel,
            amount_msat,
            cltv_expiry,
            payment_hash,
        ));
        Ok(())
    }

    async fn inspect_outgoing_payment(
        &self,
        _label: HtlcIdentifier,
        _payment_hash: PaymentHash,
    ) -> Result<OutgoingStatus, UpstreamError> {
        Ok(self.inspect_result.lock().unwrap().clone())
    }

    async fn new_address(&self) -> Result<String, UpstreamError> {
        // BIP-173 test vector, P2WPKH
        Ok("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string())
    }
}

/// Deterministic onion scheme: the first byte selects the shape, so the
/// same packet peels identically across restarts
pub struct MockOnion;

pub fn relay_onion(outgoing: ShortChannelId, amount_msat: u64, cltv: u32) -> Vec<u8> {
    let mut onion = vec![1u8];
    onion.extend_from_slice(&outgoing.0.to_be_bytes());
    onion.extend_from_slice(&amount_msat.to_be_bytes());
    onion.extend_from_slice(&cltv.to_be_bytes());
    onion
}

pub fn final_onion(amount_msat: u64, cltv: u32) -> Vec<u8> {
    let mut onion = vec![2u8];
    onion.extend_from_slice(&amount_msat.to_be_bytes());
    onion.extend_from_slice(&cltv.to_be_bytes());
    onion
}

pub fn unparseable_onion() -> Vec<u8> {
    vec![0xff; 16]
}

pub fn garbage_payload_onion() -> Vec<u8> {
    vec![0xfe; 16]
}

fn onion_secret(onion: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(onion);
    hasher.finalize().into()
}

impl OnionHandler for MockOnion {
    fn peel(
        &self,
        _node_secret: &SecretKey,
        _payment_hash: &[u8; 32],
        onion: &[u8],
    ) -> Result<PeeledOnion, OnionError> {
        let shared_secret = onion_secret(onion);
        match onion.first() {
            Some(1) if onion.len() >= 21 => {
                let scid = u64::from_be_bytes(onion[1..9].try_into().unwrap());
                let amount = u64::from_be_bytes(onion[9..17].try_into().unwrap());
                let cltv = u32::from_be_bytes(onion[17..21].try_into().unwrap());
                Ok(PeeledOnion {
                    payload: PeeledPayload::Relay(RelayPayload {
                        outgoing_channel: ShortChannelId(scid),
                        amount_to_forward_msat: amount,
                        outgoing_cltv: cltv,
                    }),
                    next_onion: onion[1..].to_vec(),
                    shared_secret,
                })
            }
            Some(2) if onion.len() >= 13 => {
                let amount = u64::from_be_bytes(onion[1..9].try_into().unwrap());
                let cltv = u32::from_be_bytes(onion[9..13].try_into().unwrap());
                Ok(PeeledOnion {
                    payload: PeeledPayload::Final(FinalPayload {
                        amount_msat: amount,
                        cltv_expiry: cltv,
                    }),
                    next_onion: vec![0u8; 8],
                    shared_secret,
                })
            }
            Some(0xfe) => Err(OnionError::Failure(FailureMessage::InvalidOnionPayload)),
            _ => Err(OnionError::Malformed {
                sha256_of_onion: shared_secret,
                failure_code: FailureMessage::InvalidOnionHmac.code(),
            }),
        }
    }

    fn failure_onion(&self, shared_secret: &[u8; 32], failure: &FailureMessage) -> Vec<u8> {
        let mut onion = vec![0xee];
        onion.extend_from_slice(&shared_secret[..4]);
        onion.extend_from_slice(&failure.encode());
        onion
    }

    fn wrap_failure_onion(&self, shared_secret: &[u8; 32], onion: Vec<u8>) -> Vec<u8> {
        let mut wrapped = vec![0xec];
        wrapped.extend_from_slice(&shared_secret[..4]);
        wrapped.extend_from_slice(&onion);
        wrapped
    }
}

/// Everything a channel scenario needs, wired to the mocks
pub struct Harness {
    pub secp: Secp256k1<All>,
    pub config: Arc<HostedConfig>,
    pub store: Arc<Store>,
    pub upstream: Arc<MockUpstream>,
    pub ctx: Arc<ChannelContext>,
    pub client_sk: SecretKey,
    pub client_pk: PublicKey,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HostedConfig::default())
    }

    pub fn with_config(config: HostedConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(config);
        let store = Arc::new(Store::open(dir.path()).expect("store opens"));
        let upstream = Arc::new(MockUpstream::new(1));
        let upstream_node: Arc<dyn UpstreamNode> = upstream.clone();
        let (client_sk, client_pk) = keypair(2);
        let ctx = Arc::new(ChannelContext::new(
            Arc::clone(&config),
            Arc::clone(&store),
            upstream_node,
            Arc::new(MockOnion),
            [7u8; 32],
        ));
        Self {
            secp: Secp256k1::new(),
            config,
            store,
            upstream,
            ctx,
            client_sk,
            client_pk,
            _dir: dir,
        }
    }

    pub fn channel(&self) -> HostedChannel {
        HostedChannel::new(self.client_pk, Arc::clone(&self.ctx), START_HEIGHT)
    }

    /// The client's signature over the mirrored form of our view
    pub fn client_sign(&self, our_view: &LastCrossSignedState) -> Signature64 {
        our_view.reverse().sign_mirrored(&self.secp, &self.client_sk)
    }

    /// The StateUpdate a well-behaved client sends to countersign our
    /// pending state
    pub fn client_countersign(&self, our_pending: &LastCrossSignedState) -> StateUpdate {
        countersign(our_pending, &self.client_sk)
    }

    /// Run the full open-as-host handshake and clear recorded messages
    pub async fn open_host_channel(&self, channel: &mut HostedChannel) {
        channel
            .on_peer_message(HostedMessage::Invoke(InvokeHostedChannel {
                chain_hash: self.ctx.chain_hash,
                refund_script_pub_key: refund_script(),
                secret: Vec::new(),
            }))
            .await
            .expect("invoke handled");

        let host_view = initial_host_view(&self.config);
        channel
            .on_peer_message(HostedMessage::StateUpdate(StateUpdate {
                block_day: host_view.block_day,
                local_updates: 0,
                remote_updates: 0,
                local_sig_of_remote_lcss: self.client_sign(&host_view),
            }))
            .await
            .expect("state update handled");
        self.upstream.take_messages();
    }
}

/// The initial state a host builds after accepting an invocation with our
/// standard refund script at `START_HEIGHT`
pub fn initial_host_view(config: &HostedConfig) -> LastCrossSignedState {
    let init = config.init_hosted_channel();
    LastCrossSignedState {
        is_host: true,
        refund_script_pub_key: refund_script(),
        block_day: block_day(START_HEIGHT),
        local_balance_msat: init.channel_capacity_msat - init.initial_client_balance_msat,
        remote_balance_msat: init.initial_client_balance_msat,
        init_hosted_channel: init,
        local_updates: 0,
        remote_updates: 0,
        incoming_htlcs: Vec::new(),
        outgoing_htlcs: Vec::new(),
        remote_sig_of_local: Signature64::ZERO,
        local_sig_of_remote: Signature64::ZERO,
    }
}

/// P2WPKH script of the BIP-173 test address served by `MockUpstream`
pub fn mock_address_script() -> Vec<u8> {
    hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").expect("static hex")
}

/// The StateUpdate `signer` sends to countersign `view` (the state as seen
/// by the side receiving the message)
pub fn countersign(view: &LastCrossSignedState, signer: &SecretKey) -> StateUpdate {
    StateUpdate {
        block_day: view.block_day,
        local_updates: view.remote_updates,
        remote_updates: view.local_updates,
        local_sig_of_remote_lcss: view.reverse().sign_mirrored(&Secp256k1::new(), signer),
    }
}

pub fn payment_pair(seed: u8) -> (PaymentPreimage, PaymentHash) {
    let preimage = PaymentPreimage::new([seed; 32]);
    (preimage, preimage.payment_hash())
}

/// Default config with some balance pushed to the client at open, so
/// remote-origin HTLCs can be funded
pub fn config_with_client_balance(msat: u64) -> HostedConfig {
    HostedConfig {
        initial_client_balance_msat: msat,
        ..HostedConfig::default()
    }
}
