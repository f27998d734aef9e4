//! In-process test doubles for the transport and client interfaces,
//! exercised directly against the public API using an in-process mock
//! transport.
//!
//! Gated behind `#[cfg(test)]` for the crate's own unit tests and behind
//! the `testing` feature for `tests/` integration tests, which build as a
//! separate crate and can't see `#[cfg(test)]` items from this one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::transport::{Client, Transport};

/// One wire-message captured by [`MockTransport`], for a test to inspect
/// or hand to a peer's [`crate::Shim::on_wire_message`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub friend: u32,
    pub msg_type: i32,
    pub bytes: Vec<u8>,
    pub receipt: u32,
}

/// A transport double with knobs for the failure modes integration tests
/// exercise: a friend that's offline, a friend whose sends are refused
/// outright, and a record of everything accepted (so a test can choose
/// which receipts to feed back, simulating retransmission, and can
/// replay accepted wire-messages into a peer).
#[derive(Default)]
pub struct MockTransport {
    next_receipt: AtomicU32,
    offline: Mutex<HashSet<u32>>,
    refuse: Mutex<HashSet<u32>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            next_receipt: AtomicU32::new(1),
            ..Default::default()
        }
    }

    pub fn set_offline(&self, friend: u32, offline: bool) {
        let mut set = self.offline.lock().unwrap();
        if offline {
            set.insert(friend);
        } else {
            set.remove(&friend);
        }
    }

    pub fn set_refuse(&self, friend: u32, refuse: bool) {
        let mut set = self.refuse.lock().unwrap();
        if refuse {
            set.insert(friend);
        } else {
            set.remove(&friend);
        }
    }

    /// Everything accepted since the last call, in send order.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    fn send_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) -> u32 {
        if self.refuse.lock().unwrap().contains(&friend) {
            return 0;
        }
        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentMessage {
            friend,
            msg_type,
            bytes: bytes.to_vec(),
            receipt,
        });
        receipt
    }

    fn is_friend_online(&self, friend: u32) -> bool {
        !self.offline.lock().unwrap().contains(&friend)
    }
}

/// A client double that records every callback it receives.
#[derive(Default)]
pub struct RecordingClient {
    messages: Mutex<Vec<(u32, i32, Vec<u8>)>>,
    receipts: Mutex<Vec<(u32, u32)>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(u32, i32, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn receipts(&self) -> Vec<(u32, u32)> {
        self.receipts.lock().unwrap().clone()
    }
}

impl Client for RecordingClient {
    fn on_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) {
        self.messages.lock().unwrap().push((friend, msg_type, bytes.to_vec()));
    }

    fn on_receipt(&self, friend: u32, receipt: u32) {
        self.receipts.lock().unwrap().push((friend, receipt));
    }
}
