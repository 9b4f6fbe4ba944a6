//! Uncommitted update queue
//!
//! Pure bookkeeping between two committed states: an ordered list of
//! updates tagged by origin, and the deterministic computation of the next
//! cross-signed state from the committed one. The queue is permissive by
//! design; admission checks (balances, caps, expiry) belong to the channel.

use crate::lcss::LastCrossSignedState;
use crate::types::HtlcIdentifier;
use crate::wire::{
    Signature64, UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};

/// Where an uncommitted update originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Originated by us; for HTLC adds, the incoming HTLC being forwarded
    Local {
        forwarded_from: Option<HtlcIdentifier>,
    },

    /// Received from the peer
    Remote,
}

impl UpdateOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, UpdateOrigin::Local { .. })
    }
}

/// One update message awaiting a cross-signed commit
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateMessage {
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
}

impl UpdateMessage {
    /// The HTLC id this update refers to
    pub fn htlc_id(&self) -> u64 {
        match self {
            UpdateMessage::Add(m) => m.id,
            UpdateMessage::Fulfill(m) => m.id,
            UpdateMessage::Fail(m) => m.id,
            UpdateMessage::FailMalformed(m) => m.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpdate {
    pub origin: UpdateOrigin,
    pub message: UpdateMessage,
}

/// Ordered queue of uncommitted updates on one channel
#[derive(Debug, Clone, Default)]
pub struct UpdateQueue {
    updates: Vec<QueuedUpdate>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, origin: UpdateOrigin, message: UpdateMessage) {
        self.updates.push(QueuedUpdate { origin, message });
    }

    /// Remove the most recently pushed update matching the predicate,
    /// returning it; used to roll back an update whose send failed
    pub fn remove_last_where<F>(&mut self, pred: F) -> Option<QueuedUpdate>
    where
        F: Fn(&QueuedUpdate) -> bool,
    {
        let idx = self.updates.iter().rposition(pred)?;
        Some(self.updates.remove(idx))
    }

    /// Drop every update matching the predicate, returning the removed ones
    /// in order
    pub fn drain_where<F>(&mut self, pred: F) -> Vec<QueuedUpdate>
    where
        F: Fn(&QueuedUpdate) -> bool,
    {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.updates)
            .into_iter()
            .partition(|u| pred(u));
        self.updates = kept;
        dropped
    }

    /// Remove the first `n` updates (the ones covered by a commit),
    /// returning them in order; later arrivals survive
    pub fn drain_first(&mut self, n: usize) -> Vec<QueuedUpdate> {
        self.updates.drain(..n.min(self.updates.len())).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedUpdate> {
        self.updates.iter()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Apply the queued updates in order on top of `base`
    ///
    /// Balances use saturating arithmetic; the channel refuses updates that
    /// would overdraw before they ever reach the queue (see
    /// [`UpdateQueue::would_overdraw`]).
    pub fn next_state(&self, base: &LastCrossSignedState) -> LastCrossSignedState {
        let mut next = base.clone();
        next.remote_sig_of_local = Signature64::ZERO;
        next.local_sig_of_remote = Signature64::ZERO;
        for queued in &self.updates {
            Self::apply(&mut next, queued);
        }
        next
    }

    fn apply(state: &mut LastCrossSignedState, queued: &QueuedUpdate) {
        let local = queued.origin.is_local();
        match &queued.message {
            UpdateMessage::Add(add) => {
                if local {
                    state.outgoing_htlcs.push(add.clone());
                    state.local_balance_msat =
                        state.local_balance_msat.saturating_sub(add.amount_msat);
                    state.local_updates += 1;
                } else {
                    state.incoming_htlcs.push(add.clone());
                    state.remote_balance_msat =
                        state.remote_balance_msat.saturating_sub(add.amount_msat);
                    state.remote_updates += 1;
                }
            }
            UpdateMessage::Fulfill(fulfill) => {
                if local {
                    // we settle an HTLC the peer sent us
                    if let Some(htlc) = Self::remove(&mut state.incoming_htlcs, fulfill.id) {
                        state.local_balance_msat += htlc.amount_msat;
                    }
                    state.local_updates += 1;
                } else {
                    if let Some(htlc) = Self::remove(&mut state.outgoing_htlcs, fulfill.id) {
                        state.remote_balance_msat += htlc.amount_msat;
                    }
                    state.remote_updates += 1;
                }
            }
            UpdateMessage::Fail(_) | UpdateMessage::FailMalformed(_) => {
                let id = queued.message.htlc_id();
                if local {
                    // failing an incoming HTLC refunds its sender
                    if let Some(htlc) = Self::remove(&mut state.incoming_htlcs, id) {
                        state.remote_balance_msat += htlc.amount_msat;
                    }
                    state.local_updates += 1;
                } else {
                    if let Some(htlc) = Self::remove(&mut state.outgoing_htlcs, id) {
                        state.local_balance_msat += htlc.amount_msat;
                    }
                    state.remote_updates += 1;
                }
            }
        }
    }

    fn remove(htlcs: &mut Vec<UpdateAddHtlc>, id: u64) -> Option<UpdateAddHtlc> {
        let idx = htlcs.iter().position(|h| h.id == id)?;
        Some(htlcs.remove(idx))
    }

    /// Whether applying the queue plus one extra debit of `extra_msat`
    /// against the local side would push either balance below zero
    pub fn would_overdraw(
        &self,
        base: &LastCrossSignedState,
        extra_local_debit_msat: u64,
        extra_remote_debit_msat: u64,
    ) -> bool {
        let mut local = base.local_balance_msat as i128;
        let mut remote = base.remote_balance_msat as i128;
        for queued in &self.updates {
            let amount = match &queued.message {
                UpdateMessage::Add(add) => add.amount_msat as i128,
                // settles and fails only ever credit a balance
                UpdateMessage::Fulfill(f) => {
                    let (credited, list) = if queued.origin.is_local() {
                        (&mut local, &base.incoming_htlcs)
                    } else {
                        (&mut remote, &base.outgoing_htlcs)
                    };
                    if let Some(h) = list.iter().find(|h| h.id == f.id) {
                        *credited += h.amount_msat as i128;
                    }
                    continue;
                }
                UpdateMessage::Fail(_) | UpdateMessage::FailMalformed(_) => {
                    let id = queued.message.htlc_id();
                    let (credited, list) = if queued.origin.is_local() {
                        (&mut remote, &base.incoming_htlcs)
                    } else {
                        (&mut local, &base.outgoing_htlcs)
                    };
                    if let Some(h) = list.iter().find(|h| h.id == id) {
                        *credited += h.amount_msat as i128;
                    }
                    continue;
                }
            };
            if queued.origin.is_local() {
                local -= amount;
            } else {
                remote -= amount;
            }
        }
        local -= extra_local_debit_msat as i128;
        remote -= extra_remote_debit_msat as i128;
        local < 0 || remote < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, PaymentHash};
    use crate::wire::InitHostedChannel;

    fn base_state() -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: true,
            refund_script_pub_key: vec![0x00, 0x14],
            init_hosted_channel: InitHostedChannel {
                max_htlc_value_in_flight_msat: 100_000_000,
                htlc_minimum_msat: 1000,
                max_accepted_htlcs: 12,
                channel_capacity_msat: 100_000_000,
                initial_client_balance_msat: 0,
            },
            block_day: 5000,
            local_balance_msat: 60_000_000,
            remote_balance_msat: 40_000_000,
            local_updates: 10,
            remote_updates: 8,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![],
            remote_sig_of_local: Signature64::ZERO,
            local_sig_of_remote: Signature64::ZERO,
        }
    }

    fn add(id: u64, amount_msat: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: ChannelId([0u8; 32]),
            id,
            amount_msat,
            payment_hash: PaymentHash([id as u8; 32]),
            cltv_expiry: 800_000,
            onion_routing_packet: vec![],
        }
    }

    #[test]
    fn test_local_add_then_remote_fulfill() {
        let base = base_state();
        let mut queue = UpdateQueue::new();
        queue.push(
            UpdateOrigin::Local {
                forwarded_from: None,
            },
            UpdateMessage::Add(add(11, 5_000_000)),
        );

        let mid = queue.next_state(&base);
        assert_eq!(mid.local_balance_msat, 55_000_000);
        assert_eq!(mid.local_updates, 11);
        assert_eq!(mid.outgoing_htlcs.len(), 1);
        assert!(mid.is_balanced());

        // the peer settles our outgoing HTLC
        let settled_base = mid;
        let mut queue = UpdateQueue::new();
        queue.push(
            UpdateOrigin::Remote,
            UpdateMessage::Fulfill(UpdateFulfillHtlc {
                channel_id: ChannelId([0u8; 32]),
                id: 11,
                payment_preimage: crate::types::PaymentPreimage([0u8; 32]),
            }),
        );
        let done = queue.next_state(&settled_base);
        assert_eq!(done.remote_balance_msat, 45_000_000);
        assert_eq!(done.remote_updates, 9);
        assert!(done.outgoing_htlcs.is_empty());
        assert!(done.is_balanced());
    }

    #[test]
    fn test_remote_add_local_fail_refunds_sender() {
        let mut base = base_state();
        base.incoming_htlcs.push(add(9, 2_000_000));
        base.remote_balance_msat -= 2_000_000;

        let mut queue = UpdateQueue::new();
        queue.push(
            UpdateOrigin::Local {
                forwarded_from: None,
            },
            UpdateMessage::Fail(UpdateFailHtlc {
                channel_id: ChannelId([0u8; 32]),
                id: 9,
                reason: vec![1],
            }),
        );
        let next = queue.next_state(&base);
        assert_eq!(next.remote_balance_msat, 40_000_000);
        assert!(next.incoming_htlcs.is_empty());
        assert_eq!(next.local_updates, 11);
        assert!(next.is_balanced());
    }

    #[test]
    fn test_order_preserved() {
        let base = base_state();
        let mut queue = UpdateQueue::new();
        queue.push(UpdateOrigin::Remote, UpdateMessage::Add(add(9, 1_000)));
        queue.push(
            UpdateOrigin::Local {
                forwarded_from: None,
            },
            UpdateMessage::Fail(UpdateFailHtlc {
                channel_id: ChannelId([0u8; 32]),
                id: 9,
                reason: vec![1],
            }),
        );
        let next = queue.next_state(&base);
        // add applied before the fail that removes it again
        assert!(next.incoming_htlcs.is_empty());
        assert_eq!(next.remote_updates, 9);
        assert_eq!(next.local_updates, 11);
        assert_eq!(next.remote_balance_msat, 40_000_000);
    }

    #[test]
    fn test_would_overdraw() {
        let base = base_state();
        let queue = UpdateQueue::new();
        assert!(!queue.would_overdraw(&base, 60_000_000, 0));
        assert!(queue.would_overdraw(&base, 60_000_001, 0));
        assert!(queue.would_overdraw(&base, 0, 40_000_001));
    }

    #[test]
    fn test_rollback_removes_last_match() {
        let mut queue = UpdateQueue::new();
        queue.push(
            UpdateOrigin::Local {
                forwarded_from: None,
            },
            UpdateMessage::Add(add(11, 1_000)),
        );
        queue.push(UpdateOrigin::Remote, UpdateMessage::Add(add(9, 2_000)));
        let removed = queue
            .remove_last_where(|u| matches!(&u.message, UpdateMessage::Add(a) if a.id == 11))
            .unwrap();
        assert_eq!(removed.message.htlc_id(), 11);
        assert_eq!(queue.len(), 1);
    }
}
