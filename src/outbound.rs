//! Outbound engine: splitting, dispatch, retransmission, and
//! client-receipt bridging for sends that exceed the transport's wire
//! limit.
//!
//! Live outbound messages are kept in an arena (`HashMap` keyed by
//! `(friend, id)`) plus a flat `active` vector used for round-robin
//! progress, preferring an arena-and-index over a circular doubly-linked
//! list: deletion is a swap-remove at a known index, with no back-pointer
//! aliasing to maintain.

use std::collections::HashMap;

use crate::config::Params;
use crate::error::{RehydrationDisagreement, Result, ShimError};
use crate::marker;
use crate::receipt_index::ReceiptIndex;
use crate::time::{TimeSource, Timestamp};
use crate::transport::Transport;
use crate::db::Persistence;

/// Result of feeding a transport receipt to the outbound engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Not one of ours: the caller should forward it to the client as-is.
    PassThrough,
    /// A stale duplicate of an already-processed receipt; swallowed.
    Discarded,
    /// A part was confirmed but the message is still incomplete.
    Progressed,
    /// All parts are confirmed; fire this client receipt.
    Completed(u32),
}

type MsgKey = (u32, u64);

struct Fragment {
    wire: Option<Vec<u8>>,
    receipt: u32,
    confirmed: bool,
    times_sent: u32,
}

struct OutboundMessage {
    friend: u32,
    msg_type: i32,
    fragments: Vec<Fragment>,
    client_receipt: u32,
    num_transit: u32,
    num_confirmed: u32,
    num_loss: u32,
    last_sent: Option<usize>,
}

impl OutboundMessage {
    fn num_parts(&self) -> u32 {
        self.fragments.len() as u32
    }
}

/// Carried alongside each live transport receipt, identifying the part it
/// stands in for.
struct ReceiptTarget {
    key: MsgKey,
    part_idx: usize,
}

/// Conservative worst-case split of `bytes` into wire-ready parts, each
/// prefixed with its marker. `id` is embedded unchanged in every part's
/// marker so a rehydrated split is byte-identical to the original.
fn split_message(id: u64, bytes: &[u8], max_wire: usize) -> Vec<Vec<u8>> {
    let length = bytes.len() as u32;
    let budget = (max_wire as u32).saturating_sub(64).max(1);
    let conservative_parts = ((length + budget - 1) / budget).max(1);
    let max_signature = marker::max_size(conservative_parts, length) as u32;
    let max_len = (max_wire as u32).saturating_sub(max_signature).max(1);
    let num_parts = (length + max_len - 1) / max_len;

    let mut parts = Vec::with_capacity(num_parts as usize);
    let mut off = 0u32;
    let mut remaining = length;
    let mut part_no = 1u32;
    while remaining > 0 {
        let step = remaining.min(max_len);
        let mut wire = Vec::new();
        marker::encode(id, part_no, num_parts, off, length, &mut wire);
        wire.extend_from_slice(&bytes[off as usize..(off + step) as usize]);
        parts.push(wire);
        off += step;
        remaining -= step;
        part_no += 1;
    }
    parts
}

pub struct OutboundEngine {
    messages: HashMap<MsgKey, OutboundMessage>,
    active: Vec<MsgKey>,
    receipts: ReceiptIndex<ReceiptTarget>,
    last_msg_id: u64,
    last_client_receipt: u32,
}

impl OutboundEngine {
    pub fn new(params: &Params) -> Self {
        Self {
            messages: HashMap::new(),
            active: Vec::new(),
            receipts: ReceiptIndex::new(),
            last_msg_id: 0,
            last_client_receipt: params.receipt_range_lo,
        }
    }

    fn next_message_id(&mut self, now: Timestamp) -> u64 {
        let candidate = now.as_millis();
        self.last_msg_id = if candidate > self.last_msg_id {
            candidate
        } else {
            self.last_msg_id + 1
        };
        self.last_msg_id
    }

    fn generate_client_receipt(&mut self, params: &Params) -> u32 {
        loop {
            self.last_client_receipt = if self.last_client_receipt + 1 <= params.receipt_range_hi {
                self.last_client_receipt + 1
            } else {
                params.receipt_range_lo
            };
            if !self
                .messages
                .values()
                .any(|m| m.client_receipt == self.last_client_receipt)
            {
                return self.last_client_receipt;
            }
        }
    }

    fn link(&mut self, key: MsgKey, msg: OutboundMessage) {
        self.messages.insert(key, msg);
        self.active.push(key);
    }

    fn unlink(&mut self, key: MsgKey) -> Option<OutboundMessage> {
        if let Some(pos) = self.active.iter().position(|k| *k == key) {
            self.active.remove(pos);
        }
        self.messages.remove(&key)
    }

    fn dispatch_part(
        &mut self,
        transport: &dyn Transport,
        key: MsgKey,
        idx: usize,
        now: Timestamp,
    ) -> bool {
        let msg = self.messages.get_mut(&key).expect("dispatch on unknown message");
        let wire = msg.fragments[idx].wire.as_ref().expect("dispatch on confirmed part");
        let receipt = transport.send_message(key.0, msg.msg_type, wire);
        if receipt == 0 {
            return false;
        }
        msg.fragments[idx].receipt = receipt;
        msg.fragments[idx].times_sent += 1;
        msg.num_transit += 1;
        self.receipts.add(
            receipt,
            ReceiptTarget { key, part_idx: idx },
            now,
        );
        true
    }

    fn send_next_parts(&mut self, transport: &dyn Transport, key: MsgKey, params: &Params, now: Timestamp) {
        let (num_parts, start) = {
            let msg = &self.messages[&key];
            (msg.num_parts() as usize, msg.last_sent.map_or(0, |i| i + 1))
        };
        for i in start..num_parts {
            if self.messages[&key].fragments[i].confirmed {
                // Rehydration can seed `confirmed` fragments ahead of
                // `last_sent`, since confirmation order need not match
                // dispatch order; skip without spending dispatch budget.
                self.messages.get_mut(&key).unwrap().last_sent = Some(i);
                continue;
            }
            if self.messages[&key].num_transit >= params.fragments_at_a_time {
                break;
            }
            if self.dispatch_part(transport, key, i, now) {
                self.messages.get_mut(&key).unwrap().last_sent = Some(i);
            }
        }
        for i in 0..num_parts {
            let msg = &self.messages[&key];
            if msg.num_transit >= params.fragments_at_a_time
                || msg.num_transit + msg.num_confirmed >= msg.num_parts()
            {
                break;
            }
            let needs_retry = !msg.fragments[i].confirmed && msg.fragments[i].receipt == 0;
            if needs_retry {
                self.dispatch_part(transport, key, i, now);
            }
        }
    }

    /// Returns the receipt to hand back to the client: the
    /// transport's own receipt for pass-through sends, an allocated client
    /// receipt for accepted oversized sends, or `0` on rejection/failure.
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        persistence: &Persistence,
        params: &Params,
        clock: &dyn TimeSource,
        friend: u32,
        msg_type: i32,
        bytes: &[u8],
    ) -> Result<u32> {
        if marker::exists(bytes) {
            tracing::warn!(friend, "rejected client send containing a forged marker");
            return Ok(0);
        }
        if bytes.len() <= params.max_wire {
            return Ok(transport.send_message(friend, msg_type, bytes));
        }

        let now = clock.now();
        let id = self.next_message_id(now);
        let wire_parts = split_message(id, bytes, params.max_wire);
        let num_parts = wire_parts.len();

        let mut msg = OutboundMessage {
            friend,
            msg_type,
            fragments: wire_parts
                .into_iter()
                .map(|wire| Fragment {
                    wire: Some(wire),
                    receipt: 0,
                    confirmed: false,
                    times_sent: 0,
                })
                .collect(),
            client_receipt: 0,
            num_transit: 0,
            num_confirmed: 0,
            num_loss: 0,
            last_sent: None,
        };

        let key = (friend, id);
        self.messages.insert(key, msg);
        for i in 0..num_parts {
            if self.messages[&key].num_transit >= params.fragments_at_a_time {
                break;
            }
            if self.dispatch_part(transport, key, i, now) {
                self.messages.get_mut(&key).unwrap().last_sent = Some(i);
            }
        }
        msg = self.messages.remove(&key).unwrap();

        if msg.num_transit == 0 {
            return Ok(0);
        }

        let client_receipt = self.generate_client_receipt(params);
        msg.client_receipt = client_receipt;
        persistence.insert_outbound_message(friend, msg_type, id, now.as_millis(), num_parts as u32, bytes, client_receipt)?;
        self.link(key, msg);
        Ok(client_receipt)
    }

    /// Re-dispatches parts whose transport receipt expired without being
    /// confirmed.
    pub fn resend_expired(&mut self, transport: &dyn Transport, params: &Params, now: Timestamp) {
        let expired = self.receipts.drain_expired(now, params.receipt_expiration_ms);
        for target in expired {
            let (times_sent, num_loss) = if let Some(msg) = self.messages.get_mut(&target.key) {
                msg.num_transit -= 1;
                msg.num_loss += 1;
                msg.fragments[target.part_idx].receipt = 0;
                (msg.fragments[target.part_idx].times_sent, msg.num_loss)
            } else {
                continue;
            };
            tracing::debug!(
                friend = target.key.0,
                part = target.part_idx,
                times_sent,
                num_loss,
                "retransmitting part after receipt expiration"
            );
            self.dispatch_part(transport, target.key, target.part_idx, now);
        }
    }

    /// Round-robin progress across all live outbound messages for friends
    /// currently online; called from the periodic worker's tick.
    pub fn send_more(&mut self, transport: &dyn Transport, params: &Params, now: Timestamp) {
        if self.active.is_empty() {
            return;
        }
        let keys = self.active.clone();
        for key in keys {
            if !self.messages.contains_key(&key) {
                continue;
            }
            if transport.is_friend_online(key.0) {
                self.send_next_parts(transport, key, params, now);
            }
        }
    }

    /// The caller is responsible for invoking the client's receipt callback
    /// per the returned outcome, after releasing whatever lock guards this
    /// call — this method itself never calls out to the client.
    pub fn on_transport_receipt(
        &mut self,
        transport: &dyn Transport,
        persistence: &Persistence,
        params: &Params,
        now: Timestamp,
        receipt: u32,
    ) -> Result<ReceiptOutcome> {
        let Some(target) = self.receipts.take(receipt) else {
            let in_range = receipt >= params.receipt_range_lo && receipt <= params.receipt_range_hi;
            return Ok(if in_range {
                tracing::debug!(receipt, "stale duplicate transport receipt, discarding");
                ReceiptOutcome::Discarded
            } else {
                ReceiptOutcome::PassThrough
            });
        };

        let key = target.key;
        let msg = self.messages.get_mut(&key).expect("receipt target for unknown message");
        msg.fragments[target.part_idx].receipt = 0;
        msg.fragments[target.part_idx].confirmed = true;
        msg.fragments[target.part_idx].wire = None;
        msg.num_confirmed += 1;
        msg.num_transit -= 1;

        persistence.outbound_part_confirmed(key.0, key.1, (target.part_idx + 1) as u32, now.as_millis())?;

        if msg.num_confirmed < msg.num_parts() {
            if transport.is_friend_online(key.0) {
                self.send_next_parts(transport, key, params, now);
            }
            Ok(ReceiptOutcome::Progressed)
        } else {
            let client_receipt = msg.client_receipt;
            persistence.clear_outbound_pending(key.0, key.1)?;
            self.unlink(key);
            Ok(ReceiptOutcome::Completed(client_receipt))
        }
    }

    /// Rehydrates live outbound state from persistence, run once at startup.
    pub fn load_pending(&mut self, persistence: &Persistence, params: &Params) -> Result<()> {
        for row in persistence.load_outbound_pending()? {
            let wire_parts = split_message(row.id, &row.message, params.max_wire);
            let num_parts = wire_parts.len() as u32;

            let reason = if num_parts != row.frags_num {
                Some(RehydrationDisagreement::PartCountMismatch)
            } else if row.frags_num as usize != row.confirmed.len() {
                Some(RehydrationDisagreement::ConfirmedLengthMismatch)
            } else {
                None
            };
            if let Some(reason) = reason {
                let err = ShimError::RehydrationMismatch {
                    friend: row.friend,
                    id: row.id,
                    reason,
                };
                tracing::warn!(error = %err, "dropping pending outbound message");
                persistence.clear_outbound_pending(row.friend, row.id)?;
                continue;
            }

            let mut fragments: Vec<Fragment> = wire_parts
                .into_iter()
                .map(|wire| Fragment {
                    wire: Some(wire),
                    receipt: 0,
                    confirmed: false,
                    times_sent: 0,
                })
                .collect();
            let mut num_confirmed = 0u32;
            for (i, f) in fragments.iter_mut().enumerate() {
                if row.confirmed[i] != 0 {
                    f.confirmed = true;
                    f.wire = None;
                    num_confirmed += 1;
                }
            }

            if num_confirmed != row.frags_done {
                let err = ShimError::RehydrationMismatch {
                    friend: row.friend,
                    id: row.id,
                    reason: RehydrationDisagreement::ConfirmedCountMismatch,
                };
                tracing::warn!(error = %err, "dropping pending outbound message");
                persistence.clear_outbound_pending(row.friend, row.id)?;
                continue;
            }
            if num_confirmed == num_parts {
                tracing::warn!(
                    friend = row.friend, id = row.id,
                    "all parts already confirmed for a pending outbound message, discarding"
                );
                persistence.clear_outbound_pending(row.friend, row.id)?;
                continue;
            }

            let msg = OutboundMessage {
                friend: row.friend,
                msg_type: row.msg_type,
                fragments,
                client_receipt: row.receipt,
                num_transit: 0,
                num_confirmed,
                num_loss: 0,
                last_sent: None,
            };
            self.link((row.friend, row.id), msg);
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.active.len()
    }
}
