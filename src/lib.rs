//! Message-defragmentation shim for MTU-limited peer-to-peer transports.
//!
//! Wraps a transport that can only carry messages up to some wire limit,
//! transparently splitting oversized sends into marker-tagged parts,
//! reassembling them on the receiving side, and bridging the transport's
//! per-part delivery receipts into a single client-visible receipt per
//! logical message. See [`Params`] for the tunables and [`db::Persistence`]
//! for the on-disk schema backing outbound durability.

pub mod config;
pub mod db;
pub mod error;
pub mod inbound;
pub mod marker;
pub mod outbound;
pub mod receipt_index;
pub mod time;
pub mod transport;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use config::Params;
pub use error::{ShimError, Result};
pub use transport::{Client, Transport};

use outbound::{OutboundEngine, ReceiptOutcome};
use time::{SystemTimeSource, TimeSource};
use worker::PeriodicWorker;

static INSTANCE_ACTIVE: AtomicBool = AtomicBool::new(false);

struct Inner {
    transport: Box<dyn Transport>,
    client: Box<dyn Client>,
    persistence: db::Persistence,
    clock: Box<dyn TimeSource>,
    params: Params,
    outbound: Mutex<OutboundEngine>,
}

impl Inner {
    /// Runs one periodic-worker tick: retransmit expired parts, then push
    /// more outbound progress, then let persistence run its own upkeep.
    fn tick(&self) {
        let now = self.clock.now();
        let mut outbound = self.outbound.lock().expect("outbound state mutex poisoned");
        outbound.resend_expired(self.transport.as_ref(), &self.params, now);
        outbound.send_more(self.transport.as_ref(), &self.params, now);
        drop(outbound);
        self.persistence.periodic();
    }
}

/// The shim itself: one instance wraps one transport. Only one concurrent
/// instance is supported per process.
pub struct Shim {
    inner: Arc<Inner>,
    worker: Option<PeriodicWorker>,
}

impl Shim {
    /// Wire up a transport and a client behind the shim, using the real
    /// system clock. Fails if another `Shim` is already live in this
    /// process, or if rehydrating pending outbound messages hits a
    /// backend error.
    pub fn new(
        transport: Box<dyn Transport>,
        client: Box<dyn Client>,
        persistence: db::Persistence,
        params: Params,
    ) -> Result<Self> {
        Self::with_clock(transport, client, persistence, params, Box::new(SystemTimeSource))
    }

    /// As [`Self::new`], but with an injected clock — used by tests that
    /// need deterministic retransmission timing.
    pub fn with_clock(
        transport: Box<dyn Transport>,
        client: Box<dyn Client>,
        persistence: db::Persistence,
        params: Params,
        clock: Box<dyn TimeSource>,
    ) -> Result<Self> {
        if INSTANCE_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(ShimError::AlreadyInitialized);
        }
        params.validate();

        let mut outbound = OutboundEngine::new(&params);
        if let Err(e) = outbound.load_pending(&persistence, &params) {
            INSTANCE_ACTIVE.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let inner = Arc::new(Inner {
            transport,
            client,
            persistence,
            clock,
            params,
            outbound: Mutex::new(outbound),
        });

        let tick_inner = Arc::clone(&inner);
        let worker = PeriodicWorker::spawn(Duration::from_millis(params.periodic_interval_ms), move || {
            tick_inner.tick();
        });

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// `0` means the transport refused every part, or the client's bytes
    /// contained a forged marker.
    pub fn send(&self, friend: u32, msg_type: i32, bytes: &[u8]) -> u32 {
        let now_clock = self.inner.clock.as_ref();
        let mut outbound = self.inner.outbound.lock().expect("outbound state mutex poisoned");
        match outbound.send(
            self.inner.transport.as_ref(),
            &self.inner.persistence,
            &self.inner.params,
            now_clock,
            friend,
            msg_type,
            bytes,
        ) {
            Ok(receipt) => receipt,
            Err(e) => error::fatal(e),
        }
    }

    /// Feed an inbound wire-message from the transport's delivery thread.
    /// Forwards to the client directly, or via reassembly.
    pub fn on_wire_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) {
        let now = self.inner.clock.now().as_millis();
        if let Err(e) = inbound::on_wire_message(
            &self.inner.persistence,
            self.inner.client.as_ref(),
            friend,
            msg_type,
            bytes,
            now,
        ) {
            error::fatal(e);
        }
    }

    /// Feed a transport receipt from the transport's delivery thread.
    pub fn on_transport_receipt(&self, friend: u32, receipt: u32) {
        let now = self.inner.clock.now();
        let outcome = {
            let mut outbound = self.inner.outbound.lock().expect("outbound state mutex poisoned");
            outbound.on_transport_receipt(
                self.inner.transport.as_ref(),
                &self.inner.persistence,
                &self.inner.params,
                now,
                receipt,
            )
        };
        match outcome {
            Ok(ReceiptOutcome::PassThrough) => self.inner.client.on_receipt(friend, receipt),
            Ok(ReceiptOutcome::Completed(client_receipt)) => {
                self.inner.client.on_receipt(friend, client_receipt)
            }
            Ok(ReceiptOutcome::Discarded) | Ok(ReceiptOutcome::Progressed) => {}
            Err(e) => error::fatal(e),
        }
    }

    pub fn params(&self) -> Params {
        self.inner.params
    }
}

impl Drop for Shim {
    fn drop(&mut self) {
        self.worker.take();
        INSTANCE_ACTIVE.store(false, Ordering::SeqCst);
    }
}
