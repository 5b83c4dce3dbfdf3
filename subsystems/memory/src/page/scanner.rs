//! # Page Scanner
//!
//! The maintenance pass behind the page-scanner daemon: usage decay on
//! active pages, writeback of modified pages whose store can take them,
//! reclaim of clean inactive pages under memory pressure, and topping off
//! the clear queue from idle free pages.

use crate::page::PageState;
use crate::vm::Vm;
use crate::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::sync::Weak;

/// Pages zeroed per pass while the clear queue is short
const CLEAR_BATCH: usize = 4;
const CLEAR_QUEUE_GOAL: usize = 8;

impl Vm {
    /// One scanner pass; runs from the kernel-daemon pool
    pub fn page_daemon_pass(&self) {
        self.decay_active_pages();
        self.write_back_modified_pages();

        let threshold = self.low_page_threshold;
        if self.page_manager.unowned_pages() < threshold {
            for frame in self.page_manager.queue_frames(PageState::Inactive) {
                if self.page_manager.unowned_pages() >= threshold {
                    break;
                }
                self.evict_page(frame);
            }
        }

        if self.page_manager.queue_len(PageState::Clear) < CLEAR_QUEUE_GOAL {
            self.page_manager.clear_some(CLEAR_BATCH);
        }
    }

    /// Decrement usage counters; pages that have gone idle move to the
    /// inactive queue
    fn decay_active_pages(&self) {
        for frame in self.page_manager.queue_frames(PageState::Active) {
            let demote = self.page_manager.with_descriptor(frame, |descriptor| {
                if descriptor.wired_count > 0 || descriptor.is_busy() {
                    return false;
                }
                descriptor.usage_count = descriptor.usage_count.saturating_sub(1);
                descriptor.usage_count <= 0
            });
            if demote {
                self.page_manager.mark_inactive(frame);
            }
        }
    }

    /// Write modified pages to their store where the store supports it;
    /// clean pages move to the inactive queue
    fn write_back_modified_pages(&self) {
        for frame in self.page_manager.queue_frames(PageState::Modified) {
            self.write_back_page(frame);
        }
    }

    fn write_back_page(&self, frame: u64) -> bool {
        let Some(cache) = self.page_manager.with_descriptor(frame, |d| d.cache()) else {
            return false;
        };

        let written = {
            let inner = cache.lock();
            if inner.scan_skip || !inner.store.supports_writeback() {
                return false;
            }
            let valid = self.page_manager.with_descriptor(frame, |descriptor| {
                if descriptor.state() != PageState::Modified || descriptor.is_busy() {
                    return None;
                }
                descriptor.busy_writing = true;
                Some(descriptor.cache_offset())
            });
            let Some(index) = valid else {
                return false;
            };

            let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
            self.page_manager.read_bytes(frame, 0, &mut buf);
            let result = inner.store.write(index * PAGE_SIZE, &buf, false);
            self.page_manager.with_descriptor(frame, |descriptor| {
                descriptor.busy_writing = false;
            });
            result.is_ok()
        };

        if written {
            self.page_manager.set_state(frame, PageState::Inactive);
            true
        } else {
            false
        }
    }

    /// Reclaim one clean inactive page: detach it from its cache, retire
    /// its mappings and free the frame
    pub(crate) fn evict_page(&self, frame: u64) -> bool {
        let Some(cache) = self.page_manager.with_descriptor(frame, |d| d.cache()) else {
            return false;
        };

        // Phase 1: detach from the cache under its lock.
        {
            let mut inner = cache.lock();
            let index = self.page_manager.with_descriptor(frame, |descriptor| {
                let owned = descriptor
                    .cache()
                    .map_or(false, |owner| Arc::ptr_eq(&owner, &cache));
                if !owned
                    || descriptor.state() != PageState::Inactive
                    || descriptor.is_busy()
                    || descriptor.wired_count > 0
                {
                    return None;
                }
                Some(descriptor.cache_offset())
            });
            let Some(index) = index else {
                return false;
            };
            inner.pages.remove(&index);
            self.page_manager.with_descriptor(frame, |descriptor| {
                descriptor.cache = Weak::new();
            });
        }

        // Phase 2: retire the mappings without the cache lock. The page is
        // no longer reachable through the cache, so new mappings cannot
        // appear.
        let mapping_ids = self.page_manager.with_descriptor(frame, |d| d.mappings.clone());
        for id in mapping_ids {
            let Some(record) = self.mappings.remove(id) else {
                continue;
            };
            if let Some(area) = self.area_by_id(record.area) {
                area.lock().mappings.retain(|&m| m != id);
                if let Some(aspace) = area.address_space() {
                    let _ = aspace.translation_map().unmap(record.address, PAGE_SIZE);
                }
            }
            self.page_manager.with_descriptor(frame, |descriptor| {
                descriptor.mappings.retain(|&m| m != id);
            });
        }

        log::trace!("scanner reclaimed frame {frame}");
        self.page_manager.free(frame);
        true
    }
}
