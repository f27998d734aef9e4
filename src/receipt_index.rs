//! Sorted, sparsely-populated receipt index.
//!
//! Maps a transport receipt to the outbound part it is standing in for.
//! The access pattern is dominated by monotonically increasing `add` and
//! near-FIFO `take`, so the index is a flat array with a live window
//! `[lo, hi)` rather than a balanced tree: appends and front-clears are
//! amortized O(1), and only out-of-order confirmation or retransmission
//! falls back to the hole-tolerant binary search.

use crate::time::Timestamp;

const SHIFT_WINDOW: usize = 16;

struct Record<T> {
    receipt: u32,
    payload: T,
    timestamp: Timestamp,
}

/// `T` is the payload carried alongside each live receipt — in this crate,
/// a reference to the outbound message and the part number it confirms.
pub struct ReceiptIndex<T> {
    records: Vec<Option<Record<T>>>,
    lo: usize,
    hi: usize,
    num: usize,
}

impl<T> Default for ReceiptIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReceiptIndex<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(32),
            lo: 0,
            hi: 0,
            num: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn len(&self) -> usize {
        self.num
    }

    fn receipt_at(&self, i: usize) -> u32 {
        self.records[i].as_ref().map_or(0, |r| r.receipt)
    }

    /// Hole-tolerant binary search. Returns `None` if the window is empty,
    /// otherwise the index of `receipt` if present, or the nearest
    /// insertion point.
    fn find(&self, receipt: u32) -> Option<usize> {
        if self.lo == self.hi {
            return None;
        }
        let mut i1 = self.lo;
        let mut i2 = self.hi;
        while i1 + 1 < i2 {
            let im = (i1 + i2) / 2;
            let mut imu = im;
            while imu + 1 < i2 && self.records[imu].is_none() {
                imu += 1;
            }
            if imu + 1 < i2 {
                let r = self.receipt_at(imu);
                if r < receipt {
                    i1 = imu;
                } else if receipt < r {
                    i2 = im;
                } else {
                    return Some(imu);
                }
            } else {
                i2 = im;
            }
        }
        Some(if self.receipt_at(i1) < receipt { i2 } else { i1 })
    }

    /// Insert a new live entry. `receipt` must be nonzero (the zero value is
    /// reserved to mark a hole).
    pub fn add(&mut self, receipt: u32, payload: T, timestamp: Timestamp) {
        debug_assert_ne!(receipt, 0, "receipt 0 is reserved for empty slots");
        let record = Record {
            receipt,
            payload,
            timestamp,
        };
        if self.hi == 0 || self.receipt_at(self.hi - 1) < receipt {
            if self.hi == self.records.len() {
                self.records.push(None);
            }
            self.records[self.hi] = Some(record);
            self.hi += 1;
        } else {
            let rec_idx = self.find(receipt).unwrap() + 1;
            if self.records[rec_idx].is_some() {
                while self.hi + SHIFT_WINDOW > self.records.len() {
                    self.records.push(None);
                }
                for i in (rec_idx..self.hi).rev() {
                    self.records[i + SHIFT_WINDOW] = self.records[i].take();
                }
                self.hi += SHIFT_WINDOW;
            }
            self.records[rec_idx] = Some(record);
        }
        self.num += 1;
    }

    /// Look up `receipt` without removing it.
    pub fn peek(&self, receipt: u32) -> Option<&T> {
        let idx = self.find(receipt)?;
        match &self.records[idx] {
            Some(r) if r.receipt == receipt => Some(&r.payload),
            _ => None,
        }
    }

    /// Remove and return the entry for `receipt`, tightening the window.
    pub fn take(&mut self, receipt: u32) -> Option<T> {
        let idx = self.find(receipt)?;
        match &self.records[idx] {
            Some(r) if r.receipt == receipt => {}
            _ => return None,
        }
        let record = self.records[idx].take().unwrap();
        self.num -= 1;
        self.tighten(idx);
        Some(record.payload)
    }

    fn tighten(&mut self, cleared_idx: usize) {
        if cleared_idx == self.lo {
            while self.lo < self.hi && self.records[self.lo].is_none() {
                self.lo += 1;
            }
        } else if cleared_idx + 1 == self.hi {
            while self.lo < self.hi && self.records[self.hi - 1].is_none() {
                self.hi -= 1;
            }
        }
        if self.lo == self.hi {
            self.lo = 0;
            self.hi = 0;
        }
    }

    /// Drain every entry whose timestamp is older than `timeout_ms` as of
    /// `now`, clearing it from the index as it is returned.
    pub fn drain_expired(&mut self, now: Timestamp, timeout_ms: u64) -> Vec<T> {
        if self.num == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut i = self.lo;
        while i < self.hi {
            let is_expired = self.records[i]
                .as_ref()
                .is_some_and(|r| now.since(r.timestamp) > timeout_ms);
            if is_expired {
                let record = self.records[i].take().unwrap();
                self.num -= 1;
                expired.push(record.payload);
            }
            i += 1;
        }
        // Re-run the window-tightening sweep from both ends once, since
        // draining can clear several holes at once.
        while self.lo < self.hi && self.records[self.lo].is_none() {
            self.lo += 1;
        }
        while self.lo < self.hi && self.records[self.hi - 1].is_none() {
            self.hi -= 1;
        }
        if self.lo == self.hi {
            self.lo = 0;
            self.hi = 0;
        }
        expired
    }

    /// Compact away holes. Reserved: not on the hot path currently, but
    /// kept for a host that observes pathological fragmentation of the
    /// window over a very long-lived process.
    pub fn compress(&mut self) {
        let mut compacted = Vec::with_capacity(self.num);
        for i in self.lo..self.hi {
            if let Some(r) = self.records[i].take() {
                compacted.push(Some(r));
            }
        }
        self.lo = 0;
        self.hi = compacted.len();
        self.records = compacted;
    }
}
