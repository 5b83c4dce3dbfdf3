//! # Anonymous Store
//!
//! Backing policy for memory with no external source: pages spring into
//! existence zero-filled on first touch. The store's job is purely
//! accounting - deciding when physical memory is promised at the system
//! commit counter - plus the stack-guard check.

use super::{CacheWindow, FaultHandling};
use crate::commit::CommitAccounting;
use crate::{VmError, VmResult, PAGE_SIZE};
use alloc::sync::Arc;

/// Which way a stack area grows; decides which end the guard window sits at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowth {
    /// Stack grows toward lower addresses; guard at the low end
    Downward,
    /// Stack grows toward higher addresses; guard at the high end
    Upward,
}

/// Store for demand-zero memory.
pub struct AnonymousStore {
    commitment: Arc<CommitAccounting>,
    committed_size: u64,
    can_overcommit: bool,
    has_precommitted: bool,
    precommitted_pages: u8,
    guarded_size: u64,
    growth: StackGrowth,
}

impl AnonymousStore {
    /// Create a store.
    ///
    /// In overcommit mode `precommit_pages` pages are reserved up front
    /// (clamped to 255) so early faults are less likely to fail; everything
    /// beyond that is reserved one page at a time at fault time.
    /// `guard_pages` pages at the growth end of the window can never be
    /// faulted in.
    pub fn new(
        commitment: Arc<CommitAccounting>,
        can_overcommit: bool,
        precommit_pages: u32,
        guard_pages: u32,
        growth: StackGrowth,
    ) -> Self {
        let precommitted_pages = precommit_pages.min(255) as u8;
        let mut store = Self {
            commitment,
            committed_size: 0,
            can_overcommit,
            has_precommitted: false,
            precommitted_pages,
            guarded_size: guard_pages as u64 * PAGE_SIZE,
            growth,
        };

        if can_overcommit && precommitted_pages > 0 {
            let bytes = precommitted_pages as u64 * PAGE_SIZE;
            if store.commitment.try_reserve(bytes) {
                store.committed_size = bytes;
            } else {
                // Keep the budget honest: without the reservation the
                // precommitted faults would bypass accounting entirely.
                store.precommitted_pages = 0;
            }
            store.has_precommitted = true;
        }

        store
    }

    /// Bytes reserved at the commit counter on behalf of this store
    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    /// Guard window length in bytes
    pub fn guarded_size(&self) -> u64 {
        self.guarded_size
    }

    /// The guard range within `window` as `(start, length)`, if one is set
    pub fn guard_range(&self, window: CacheWindow) -> Option<(u64, u64)> {
        if self.guarded_size == 0 {
            return None;
        }
        let start = match self.growth {
            StackGrowth::Downward => 0,
            StackGrowth::Upward => window.size - self.guarded_size,
        };
        Some((start, self.guarded_size))
    }

    /// Commit up to the absolute end offset `size`.
    ///
    /// Anonymous stores don't need to span their whole source, so the
    /// cache's window base is subtracted first. Overcommitting stores only
    /// ever hold their precommit reservation here; real commitment happens
    /// page by page in [`Self::fault`].
    pub fn commit(&mut self, size: u64, window: CacheWindow) -> VmResult<()> {
        let mut size = size.saturating_sub(window.base);

        if self.can_overcommit {
            if self.has_precommitted {
                return Ok(());
            }
            self.has_precommitted = true;
            let precommitted = self.precommitted_pages as u64 * PAGE_SIZE;
            if size > precommitted {
                size = precommitted;
            }
        }

        if size > self.committed_size {
            if !self.commitment.try_reserve(size - self.committed_size) {
                return Err(VmError::OutOfMemory);
            }
        } else {
            self.commitment.unreserve(self.committed_size - size);
        }

        self.committed_size = size;
        Ok(())
    }

    /// Account for a fault at `offset` within `window`.
    ///
    /// Fails with `BadAddress` in the guard range (a stack overflow) and
    /// with `OutOfMemory` when no page can be promised. On success the VM
    /// proceeds with a demand-zero page.
    pub fn fault(&mut self, offset: u64, window: CacheWindow) -> VmResult<FaultHandling> {
        if let Some((guard_start, guard_length)) = self.guard_range(window) {
            if offset >= guard_start && offset < guard_start + guard_length {
                log::debug!("stack overflow: fault in guard range at offset {offset:#x}");
                return Err(VmError::BadAddress);
            }
        }

        if self.precommitted_pages > 0 {
            self.precommitted_pages -= 1;
        } else {
            if !self.commitment.try_reserve(PAGE_SIZE) {
                return Err(VmError::OutOfMemory);
            }
            self.committed_size += PAGE_SIZE;
        }

        Ok(FaultHandling::DemandZero)
    }
}

impl Drop for AnonymousStore {
    fn drop(&mut self) {
        self.commitment.unreserve(self.committed_size);
    }
}
