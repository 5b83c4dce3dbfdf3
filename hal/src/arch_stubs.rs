//! # Architecture Stubs
//!
//! Software fallback implementations used when no architecture crate is
//! selected, and by the hosted unit tests of the memory subsystem.

use crate::mmu::{MapProtection, TranslationMap};
use crate::{HalResult, PhysAddr, VirtAddr, PAGE_SIZE};
use alloc::collections::BTreeMap;
use spin::Mutex;

/// A software translation map.
///
/// Keeps one entry per page in a sorted map. It honors the full
/// [`TranslationMap`] contract, so the memory subsystem behaves identically
/// on top of it and on top of a real page table.
pub struct SoftTranslationMap {
    entries: Mutex<BTreeMap<u64, (PhysAddr, MapProtection)>>,
}

impl SoftTranslationMap {
    /// Create an empty map
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for SoftTranslationMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationMap for SoftTranslationMap {
    fn map(&self, virt: VirtAddr, phys: PhysAddr, protection: MapProtection) -> HalResult<()> {
        self.entries
            .lock()
            .insert(virt.page_base().as_u64(), (phys, protection));
        Ok(())
    }

    fn unmap(&self, base: VirtAddr, size: u64) -> HalResult<()> {
        let start = base.page_base().as_u64();
        let end = start + size;
        let mut entries = self.entries.lock();
        let in_range: alloc::vec::Vec<u64> = entries
            .range(start..end)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in in_range {
            entries.remove(&addr);
        }
        Ok(())
    }

    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, MapProtection)> {
        self.entries
            .lock()
            .get(&virt.page_base().as_u64())
            .copied()
    }

    fn protect(&self, base: VirtAddr, size: u64, protection: MapProtection) -> HalResult<()> {
        let start = base.page_base().as_u64();
        let end = start + size;
        let mut entries = self.entries.lock();
        for (_, entry) in entries.range_mut(start..end) {
            entry.1 = protection;
        }
        Ok(())
    }

    fn flush(&self) {
        // Nothing buffered in the software map.
    }

    fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}
