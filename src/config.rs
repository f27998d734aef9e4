//! Tunable parameters.
//!
//! A `Default` baseline plus chained `with_*` setters, validated once at
//! the boundary where the shim is handed off to the caller rather than on
//! every read.

use tracing::warn;

use crate::marker;

/// Tunable knobs for the defragmentation shim.
///
/// Passed by value to [`crate::Shim::new`]/[`crate::Shim::with_clock`]; there
/// is no way to change these on a live shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Largest payload the transport will carry in one wire-message.
    /// Messages at or under this size are passed through untouched.
    pub max_wire: usize,
    /// Per-message in-flight parts cap (`fragmentsAtATime`).
    pub fragments_at_a_time: u32,
    /// Retransmit timeout for an unconfirmed part.
    pub receipt_expiration_ms: u64,
    /// Inclusive lower bound of the client-receipt allocation window.
    pub receipt_range_lo: u32,
    /// Inclusive upper bound of the client-receipt allocation window.
    pub receipt_range_hi: u32,
    /// Cadence of the periodic worker's resend/dispatch tick.
    pub periodic_interval_ms: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_wire: 1372,
            fragments_at_a_time: 512,
            receipt_expiration_ms: 20_000,
            receipt_range_lo: 0x7000_0000,
            receipt_range_hi: 0x7fff_ffff,
            periodic_interval_ms: 2_000,
        }
    }
}

impl Params {
    pub fn with_max_wire(mut self, max_wire: usize) -> Self {
        self.max_wire = max_wire;
        self
    }

    pub fn with_fragments_at_a_time(mut self, n: u32) -> Self {
        self.fragments_at_a_time = n;
        self
    }

    pub fn with_receipt_expiration_ms(mut self, ms: u64) -> Self {
        self.receipt_expiration_ms = ms;
        self
    }

    pub fn with_receipt_range(mut self, lo: u32, hi: u32) -> Self {
        self.receipt_range_lo = lo;
        self.receipt_range_hi = hi;
        self
    }

    pub fn with_periodic_interval_ms(mut self, ms: u64) -> Self {
        self.periodic_interval_ms = ms;
        self
    }

    /// Sanity-check the configuration. Violations are logged, not
    /// rejected, and the configuration is otherwise honored as given.
    pub fn validate(&self) {
        let marker_floor = marker::max_size(1, 1);
        if self.max_wire <= marker_floor {
            warn!(
                max_wire = self.max_wire,
                marker_floor, "max_wire does not exceed the marker's own overhead"
            );
        }
        if self.receipt_range_lo >= self.receipt_range_hi {
            warn!(
                lo = self.receipt_range_lo,
                hi = self.receipt_range_hi,
                "receipt range is empty or inverted"
            );
        }
        if self.fragments_at_a_time == 0 {
            warn!("fragments_at_a_time is zero, outbound messages will never dispatch");
        }
    }
}
