//! # Commit Accounting
//!
//! One system-wide counter tracks how much physical memory has been promised
//! to stores. A reservation either adds exactly the requested amount or
//! leaves the counter unchanged; there is no partial success.

use core::sync::atomic::{AtomicU64, Ordering};

/// The system-wide commit counter.
pub struct CommitAccounting {
    limit: u64,
    used: AtomicU64,
}

impl CommitAccounting {
    /// Create an accounting with the given ceiling in bytes
    pub const fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Try to reserve `bytes`; all-or-nothing
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.limit {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` previously reserved
    pub fn unreserve(&self, bytes: u64) {
        let previous = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "commit counter underflow");
    }

    /// Bytes currently reserved
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// The ceiling in bytes
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes still reservable
    pub fn available(&self) -> u64 {
        self.limit - self.used()
    }
}
