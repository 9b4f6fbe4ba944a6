//! Durable channel store
//!
//! One JSON file per channel keyed by peer pubkey hex, plus two small aux
//! files for the HTLC forwarding table and the released-preimage cache.
//! Every mutation goes through [`Store::update`], which compares old and
//! new data by value and rewrites only the files that actually changed;
//! each file write is atomic (tmp file + rename), so a crash leaves either
//! the previous or the next state on disk, never a torn one.

use crate::lcss::LastCrossSignedState;
use crate::types::{HtlcIdentifier, PaymentHash, PaymentPreimage};
use crate::wire::{ErrorMessage, UpdateAddHtlc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A protocol error we recorded against a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedError {
    /// The signed error sent to the peer
    pub error: ErrorMessage,

    /// The HTLC that triggered it, if any
    pub htlc: Option<UpdateAddHtlc>,

    /// Free-text reason for operators
    pub description: String,
}

/// Durable state of one hosted channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelRecord {
    /// Committed, mutually signed balance snapshot
    pub lcss: Option<LastCrossSignedState>,

    /// Errors we raised; non-empty means the channel is errored
    pub local_errors: Vec<DetailedError>,

    /// Errors received from the peer
    pub remote_errors: Vec<ErrorMessage>,

    pub suspended: bool,

    /// Host-proposed override awaiting the client's countersignature
    pub proposed_override: Option<LastCrossSignedState>,

    /// Pre-authorized new capacity; no consumer yet, kept for the future
    /// resize message
    pub accepting_resize: Option<u64>,
}

/// Everything the store persists
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreData {
    /// Channel records keyed by peer pubkey hex (66 chars)
    pub channels: HashMap<String, ChannelRecord>,

    /// In-flight forwards: incoming HTLC -> outgoing HTLC
    pub htlc_forwards: HashMap<HtlcIdentifier, HtlcIdentifier>,

    /// Preimages revealed downstream but not yet in a cross-signed state
    pub preimages: HashMap<PaymentHash, PaymentPreimage>,
}

const FORWARDS_FILE: &str = "htlc-forwards.json";
const PREIMAGES_FILE: &str = "preimages.json";

/// File-backed store of all hosted-channel state
pub struct Store {
    data_dir: PathBuf,
    inner: Mutex<StoreData>,
}

impl Store {
    /// Open (or initialize) the store under `data_dir`
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Store, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join("channels"))?;

        let mut data = StoreData::default();
        for entry in fs::read_dir(data_dir.join("channels"))? {
            let path = entry?.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let is_peer_file = path.extension().and_then(|e| e.to_str()) == Some("json")
                && stem.len() == 66
                && stem.bytes().all(|b| b.is_ascii_hexdigit());
            if !is_peer_file {
                warn!(path = %path.display(), "Skipping alien file in channels dir");
                continue;
            }
            let record: ChannelRecord = serde_json::from_slice(&fs::read(&path)?)?;
            data.channels.insert(stem, record);
        }

        let forwards_path = data_dir.join(FORWARDS_FILE);
        if forwards_path.exists() {
            let pairs: Vec<(HtlcIdentifier, HtlcIdentifier)> =
                serde_json::from_slice(&fs::read(&forwards_path)?)?;
            data.htlc_forwards = pairs.into_iter().collect();
        }

        let preimages_path = data_dir.join(PREIMAGES_FILE);
        if preimages_path.exists() {
            let pairs: Vec<(String, String)> =
                serde_json::from_slice(&fs::read(&preimages_path)?)?;
            for (hash_hex, preimage_hex) in pairs {
                match (
                    PaymentHash::from_hex(&hash_hex),
                    PaymentPreimage::from_hex(&preimage_hex),
                ) {
                    (Ok(hash), Ok(preimage)) => {
                        data.preimages.insert(hash, preimage);
                    }
                    _ => warn!(hash = %hash_hex, "Skipping unparseable preimage entry"),
                }
            }
        }

        debug!(
            channels = data.channels.len(),
            forwards = data.htlc_forwards.len(),
            preimages = data.preimages.len(),
            "Store loaded"
        );
        Ok(Store {
            data_dir,
            inner: Mutex::new(data),
        })
    }

    /// Read-only copy of the current state
    pub fn snapshot(&self) -> StoreData {
        self.inner.lock().expect("store lock").clone()
    }

    /// The record for one peer, defaulting to an empty one
    pub fn channel(&self, peer_hex: &str) -> ChannelRecord {
        self.inner
            .lock()
            .expect("store lock")
            .channels
            .get(peer_hex)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply `mutate` as one checkpoint: files whose content is unchanged
    /// by value are not touched, changed files are written atomically, and
    /// the in-memory state is replaced only once all writes succeeded
    pub fn update<T>(
        &self,
        mutate: impl FnOnce(&mut StoreData) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.lock().expect("store lock");
        let mut next = guard.clone();
        let out = mutate(&mut next);

        for (peer_hex, record) in &next.channels {
            if guard.channels.get(peer_hex) != Some(record) {
                let path = self.data_dir.join("channels").join(format!("{peer_hex}.json"));
                write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
                debug!(peer = %peer_hex, "Channel record persisted");
            }
        }

        if next.htlc_forwards != guard.htlc_forwards {
            let mut pairs: Vec<(HtlcIdentifier, HtlcIdentifier)> =
                next.htlc_forwards.iter().map(|(k, v)| (*k, *v)).collect();
            pairs.sort_by_key(|(k, _)| (k.short_channel_id, k.htlc_id));
            write_atomic(
                &self.data_dir.join(FORWARDS_FILE),
                &serde_json::to_vec_pretty(&pairs)?,
            )?;
        }

        if next.preimages != guard.preimages {
            let mut pairs: Vec<(String, String)> = next
                .preimages
                .iter()
                .map(|(hash, preimage)| (hash.to_hex(), preimage.to_hex()))
                .collect();
            pairs.sort();
            write_atomic(
                &self.data_dir.join(PREIMAGES_FILE),
                &serde_json::to_vec_pretty(&pairs)?,
            )?;
        }

        *guard = next;
        Ok(out)
    }

    /// Drop every preimage whose hash no longer appears among the HTLCs of
    /// any committed state; returns how many were collected
    pub fn gc_preimages(&self) -> Result<usize, StoreError> {
        self.update(|data| {
            let live: HashSet<PaymentHash> = data
                .channels
                .values()
                .filter_map(|record| record.lcss.as_ref())
                .flat_map(|lcss| {
                    lcss.incoming_htlcs
                        .iter()
                        .chain(lcss.outgoing_htlcs.iter())
                        .map(|h| h.payment_hash)
                })
                .collect();
            let before = data.preimages.len();
            data.preimages.retain(|hash, _| live.contains(hash));
            let collected = before - data.preimages.len();
            if collected > 0 {
                debug!(collected, "Preimage cache GC");
            }
            collected
        })
    }
}

/// Write `bytes` to `path` atomically via a sibling tmp file
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortChannelId;

    fn peer_hex(seed: u8) -> String {
        let mut raw = vec![0x02u8];
        raw.extend_from_slice(&[seed; 32]);
        hex::encode(raw)
    }

    #[test]
    fn test_roundtrip_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let peer = peer_hex(1);
        let preimage = PaymentPreimage::new_random();
        let incoming = HtlcIdentifier::new(ShortChannelId(77), 4);
        let outgoing = HtlcIdentifier::new(ShortChannelId(99), 1);
        store
            .update(|data| {
                let record = data.channels.entry(peer.clone()).or_default();
                record.suspended = true;
                data.htlc_forwards.insert(incoming, outgoing);
                data.preimages.insert(preimage.payment_hash(), preimage);
            })
            .unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        let data = reopened.snapshot();
        assert!(data.channels.get(&peer).unwrap().suspended);
        assert_eq!(data.htlc_forwards.get(&incoming), Some(&outgoing));
        assert_eq!(
            data.preimages.get(&preimage.payment_hash()),
            Some(&preimage)
        );
    }

    #[test]
    fn test_unchanged_files_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let peer_a = peer_hex(1);
        let peer_b = peer_hex(2);
        store
            .update(|data| {
                data.channels.entry(peer_a.clone()).or_default();
                data.channels.entry(peer_b.clone()).or_default();
            })
            .unwrap();

        let a_path = dir.path().join("channels").join(format!("{peer_a}.json"));
        let before = fs::metadata(&a_path).unwrap().modified().unwrap();

        // mutating only peer_b must leave peer_a's file alone
        std::thread::sleep(std::time::Duration::from_millis(20));
        store
            .update(|data| {
                data.channels.get_mut(&peer_b).unwrap().suspended = true;
            })
            .unwrap();
        let after = fs::metadata(&a_path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_alien_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("channels")).unwrap();
        fs::write(dir.path().join("channels").join("notes.json"), b"{}").unwrap();
        fs::write(dir.path().join("channels").join("README"), b"hi").unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.snapshot().channels.is_empty());
    }

    #[test]
    fn test_preimage_gc_keeps_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let kept = PaymentPreimage::new_random();
        let dropped = PaymentPreimage::new_random();

        store
            .update(|data| {
                data.preimages.insert(kept.payment_hash(), kept);
                data.preimages.insert(dropped.payment_hash(), dropped);
                let record = data.channels.entry(peer_hex(1)).or_default();
                record.lcss = Some(crate::lcss::LastCrossSignedState {
                    is_host: true,
                    refund_script_pub_key: vec![],
                    init_hosted_channel: crate::wire::InitHostedChannel {
                        max_htlc_value_in_flight_msat: 0,
                        htlc_minimum_msat: 0,
                        max_accepted_htlcs: 0,
                        channel_capacity_msat: 1000,
                        initial_client_balance_msat: 0,
                    },
                    block_day: 0,
                    local_balance_msat: 0,
                    remote_balance_msat: 0,
                    local_updates: 0,
                    remote_updates: 0,
                    incoming_htlcs: vec![UpdateAddHtlc {
                        channel_id: crate::types::ChannelId([0u8; 32]),
                        id: 1,
                        amount_msat: 1000,
                        payment_hash: kept.payment_hash(),
                        cltv_expiry: 1,
                        onion_routing_packet: vec![],
                    }],
                    outgoing_htlcs: vec![],
                    remote_sig_of_local: crate::wire::Signature64::ZERO,
                    local_sig_of_remote: crate::wire::Signature64::ZERO,
                });
            })
            .unwrap();

        assert_eq!(store.gc_preimages().unwrap(), 1);
        let data = store.snapshot();
        assert!(data.preimages.contains_key(&kept.payment_hash()));
        assert!(!data.preimages.contains_key(&dropped.payment_hash()));
    }
}
