//! Last cross-signed state
//!
//! The atomic unit of agreement on a hosted channel. Each side signs the
//! state *as viewed from the other side* (balances and HTLC lists swapped,
//! `is_host` inverted), so a single signature exchange leaves both parties
//! holding a snapshot countersigned by their peer.

use crate::types::{hex_serde, PaymentHash};
use crate::wire::{
    decode_add_htlc, decode_init, encode_add_htlc, encode_init, InitHostedChannel, Reader,
    Signature64, StateUpdate, UpdateAddHtlc, Writer, WireError,
};
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Mutually signed balance snapshot of one hosted channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastCrossSignedState {
    /// Role of the side this view belongs to
    pub is_host: bool,

    /// Client refund script, fixed at invocation
    #[serde(with = "hex_serde")]
    pub refund_script_pub_key: Vec<u8>,

    /// Static channel parameters, fixed at invocation
    pub init_hosted_channel: InitHostedChannel,

    /// Coarse timestamp (block height / 144) bounding staleness
    pub block_day: u32,

    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,

    /// Monotone count of updates originated by this side
    pub local_updates: u32,

    /// Monotone count of updates originated by the peer
    pub remote_updates: u32,

    pub incoming_htlcs: Vec<UpdateAddHtlc>,
    pub outgoing_htlcs: Vec<UpdateAddHtlc>,

    /// Peer's signature over this view
    pub remote_sig_of_local: Signature64,

    /// Our signature over the mirrored view
    pub local_sig_of_remote: Signature64,
}

impl LastCrossSignedState {
    /// The same state as seen by the other party
    pub fn reverse(&self) -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: !self.is_host,
            refund_script_pub_key: self.refund_script_pub_key.clone(),
            init_hosted_channel: self.init_hosted_channel.clone(),
            block_day: self.block_day,
            local_balance_msat: self.remote_balance_msat,
            remote_balance_msat: self.local_balance_msat,
            local_updates: self.remote_updates,
            remote_updates: self.local_updates,
            incoming_htlcs: self.outgoing_htlcs.clone(),
            outgoing_htlcs: self.incoming_htlcs.clone(),
            remote_sig_of_local: self.local_sig_of_remote,
            local_sig_of_remote: self.remote_sig_of_local,
        }
    }

    /// Canonical encoding covered by signatures: every field except the
    /// signatures themselves
    pub fn encode_for_signing(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_fields(&mut w);
        w.into_vec()
    }

    fn encode_fields(&self, w: &mut Writer) {
        w.put_u8(self.is_host as u8);
        w.put_var_bytes(&self.refund_script_pub_key);
        encode_init(w, &self.init_hosted_channel);
        w.put_u32(self.block_day);
        w.put_u64(self.local_balance_msat);
        w.put_u64(self.remote_balance_msat);
        w.put_u32(self.local_updates);
        w.put_u32(self.remote_updates);
        for htlcs in [&self.incoming_htlcs, &self.outgoing_htlcs] {
            w.put_u16(htlcs.len() as u16);
            for htlc in htlcs.iter() {
                let mut inner = Writer::new();
                encode_add_htlc(&mut inner, htlc);
                w.put_var_bytes(&inner.into_vec());
            }
        }
    }

    /// Full wire encoding including both signatures
    pub(crate) fn encode(&self, w: &mut Writer) {
        self.encode_fields(w);
        w.put_bytes(&self.remote_sig_of_local.0);
        w.put_bytes(&self.local_sig_of_remote.0);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<LastCrossSignedState, WireError> {
        let is_host = r.u8()? != 0;
        let refund_script_pub_key = r.var_bytes()?;
        let init_hosted_channel = decode_init(r)?;
        let block_day = r.u32()?;
        let local_balance_msat = r.u64()?;
        let remote_balance_msat = r.u64()?;
        let local_updates = r.u32()?;
        let remote_updates = r.u32()?;
        let mut lists = [Vec::new(), Vec::new()];
        for list in lists.iter_mut() {
            let count = r.u16()? as usize;
            for _ in 0..count {
                let raw = r.var_bytes()?;
                let mut inner = Reader::new(&raw);
                list.push(decode_add_htlc(&mut inner)?);
            }
        }
        let [incoming_htlcs, outgoing_htlcs] = lists;
        Ok(LastCrossSignedState {
            is_host,
            refund_script_pub_key,
            init_hosted_channel,
            block_day,
            local_balance_msat,
            remote_balance_msat,
            local_updates,
            remote_updates,
            incoming_htlcs,
            outgoing_htlcs,
            remote_sig_of_local: Signature64(r.array64()?),
            local_sig_of_remote: Signature64(r.array64()?),
        })
    }

    /// Full wire encoding as a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_vec()
    }

    /// Digest signatures commit to
    pub fn sig_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.encode_for_signing());
        hasher.finalize().into()
    }

    /// Produce our signature over the mirrored view
    pub fn sign_mirrored(&self, secp: &Secp256k1<All>, secret: &SecretKey) -> Signature64 {
        let digest = self.reverse().sig_hash();
        let msg = Message::from_slice(&digest).expect("digest is 32 bytes");
        Signature64(secp.sign_ecdsa(&msg, secret).serialize_compact())
    }

    /// Check `remote_sig_of_local` against this view under `signer`
    ///
    /// For our stored state `signer` is the peer; for a state received in
    /// the peer's view, pass our own pubkey to check the signature the peer
    /// attributes to us.
    pub fn verify_remote_sig(&self, secp: &Secp256k1<All>, signer: &PublicKey) -> bool {
        let digest = self.sig_hash();
        let msg = Message::from_slice(&digest).expect("digest is 32 bytes");
        match Signature::from_compact(&self.remote_sig_of_local.0) {
            Ok(sig) => secp.verify_ecdsa(&msg, &sig, signer).is_ok(),
            Err(_) => false,
        }
    }

    /// Combined update counter used to decide which snapshot is newer
    pub fn total_updates(&self) -> u64 {
        self.local_updates as u64 + self.remote_updates as u64
    }

    pub fn is_ahead_of(&self, other: &LastCrossSignedState) -> bool {
        self.total_updates() > other.total_updates()
    }

    /// Balance conservation: balances plus HTLCs in flight must equal the
    /// channel capacity
    pub fn is_balanced(&self) -> bool {
        let in_flight: u64 = self
            .incoming_htlcs
            .iter()
            .chain(self.outgoing_htlcs.iter())
            .map(|h| h.amount_msat)
            .sum();
        self.local_balance_msat + self.remote_balance_msat + in_flight
            == self.init_hosted_channel.channel_capacity_msat
    }

    pub fn incoming_htlc(&self, id: u64) -> Option<&UpdateAddHtlc> {
        self.incoming_htlcs.iter().find(|h| h.id == id)
    }

    pub fn outgoing_htlc(&self, id: u64) -> Option<&UpdateAddHtlc> {
        self.outgoing_htlcs.iter().find(|h| h.id == id)
    }

    pub fn has_payment_hash(&self, hash: &PaymentHash) -> bool {
        self.incoming_htlcs
            .iter()
            .chain(self.outgoing_htlcs.iter())
            .any(|h| h.payment_hash == *hash)
    }

    /// The `StateUpdate` message carrying this view's counters and our
    /// signature of the mirror
    pub fn state_update(&self) -> StateUpdate {
        StateUpdate {
            block_day: self.block_day,
            local_updates: self.local_updates,
            remote_updates: self.remote_updates,
            local_sig_of_remote_lcss: self.local_sig_of_remote,
        }
    }
}
