//! # Page Fault Resolution
//!
//! Turning a faulting address into an installed translation:
//!
//! 1. Resolve the address to an area under the address space's read lock
//!    and check the access against the area's protection.
//! 2. Walk the cache chain for a page at the faulting offset, locking one
//!    cache at a time from the top down. A level whose store has backing
//!    demand-reads the page with the cache lock dropped and the page pinned
//!    busy; concurrent faulters wait on the busy page and retry.
//! 3. A miss everywhere asks the top store's fault hook, which either
//!    accounts a demand-zero page, hands back a device frame, or fails.
//! 4. A write that found its page in an ancestor copies it up into the top
//!    cache first.
//! 5. Install the translation and record the mapping on both the page's
//!    and the area's mapping list.
//!
//! Write permission is only ever granted on write faults, so the first
//! write to any page arrives here for copy-on-write and modified tracking.

use crate::address_space::AddressSpace;
use crate::area::{AccessKind, Area, AreaWiring};
use crate::cache::Cache;
use crate::mapping::MappingRecord;
use crate::page::{PageState, PageType};
use crate::store::FaultHandling;
use crate::vm::Vm;
use crate::{VmError, VmResult, PAGE_SIZE};
use alloc::sync::Arc;
use vireo_hal::{PhysAddr, VirtAddr};

/// Spins on a busy page before the wait is treated as cancelled
const BUSY_WAIT_SPINS: u32 = 1_000_000;

enum FaultPage {
    /// A page with a descriptor, resident in the top cache
    Tracked { frame: u64 },
    /// A raw frame the store mapped directly (device windows)
    Untracked(PhysAddr),
}

impl Vm {
    /// Resolve a fault at `address` in `aspace`.
    ///
    /// Errors unwind to the caller: for user faults they become signals at
    /// the syscall layer, for kernel faults the caller panics with the
    /// faulting context.
    pub fn page_fault(
        &self,
        aspace: &Arc<AddressSpace>,
        address: VirtAddr,
        kind: AccessKind,
        user: bool,
    ) -> VmResult<()> {
        let area = aspace.find_area(address).ok_or(VmError::BadAddress)?;
        let protection = area.protection();
        if !protection.allows(kind, user) {
            log::debug!(
                "protection violation: {kind:?} at {:#x} in area {}",
                address.as_u64(),
                area.id()
            );
            return Err(VmError::ProtectionViolation);
        }

        let (top_cache, offset, wiring) = {
            let inner = area.lock();
            let offset =
                address.page_base().as_u64() - area.base().as_u64() + inner.cache_offset;
            (inner.cache.clone(), offset, inner.wiring)
        };

        aspace.count_fault();

        let write = kind == AccessKind::Write;
        let page = self.fault_get_page(&top_cache, offset, write)?;

        let page_address = address.page_base();
        match page {
            FaultPage::Tracked { frame } => {
                self.page_manager.mark_active(frame);
                if write {
                    self.page_manager.mark_modified(frame);
                }

                let map_protection = protection.to_map_protection(write);
                aspace
                    .translation_map()
                    .map(page_address, PhysAddr::from_frame(frame), map_protection)
                    .map_err(|_| VmError::OutOfMemory)?;

                let outcome = self.record_mapping(&area, frame, page_address);
                if wiring == AreaWiring::Lazy {
                    match outcome {
                        MappingOutcome::New => self.page_manager.wire(frame),
                        MappingOutcome::Replaced { old_frame } => {
                            self.page_manager.unwire(old_frame);
                            self.page_manager.wire(frame);
                        }
                        MappingOutcome::Existing => {}
                    }
                }
            }
            FaultPage::Untracked(phys) => {
                // Device frames carry no descriptor and no reverse mapping;
                // grant the area's full protection up front.
                let map_protection = protection.to_map_protection(protection.is_writable());
                aspace
                    .translation_map()
                    .map(page_address, phys, map_protection)
                    .map_err(|_| VmError::OutOfMemory)?;
            }
        }

        Ok(())
    }

    /// Find the page backing `offset`, creating it if the chain misses.
    /// On success the page is resident in the top cache unless the fault
    /// was a read satisfied from an ancestor.
    fn fault_get_page(
        &self,
        top: &Arc<Cache>,
        offset: u64,
        write: bool,
    ) -> VmResult<FaultPage> {
        let index = offset / PAGE_SIZE;
        let mut spins: u32 = 0;

        'retry: loop {
            // Walk the chain, locking one cache at a time.
            let mut current = top.clone();
            let mut depth = 0usize;
            let found = loop {
                let mut inner = current.lock();

                if let Some(&frame) = inner.pages.get(&index) {
                    let busy = self.page_manager.with_descriptor(frame, |d| d.is_busy());
                    if busy {
                        drop(inner);
                        spins += 1;
                        if spins > BUSY_WAIT_SPINS {
                            return Err(VmError::Interrupted);
                        }
                        core::hint::spin_loop();
                        continue 'retry;
                    }
                    break Some((frame, depth));
                }

                if inner.store.has_page(offset) {
                    // Demand-read at this level. Pin a busy page into the
                    // cache, then read with the lock dropped.
                    let Some(reader) = inner.store.reader() else {
                        break None;
                    };
                    let frame = self.page_manager.allocate(false)?;
                    self.page_manager.with_descriptor(frame, |descriptor| {
                        descriptor.busy_reading = true;
                        descriptor.page_type = PageType::Dummy;
                    });
                    self.page_manager.set_state(frame, PageState::Busy);
                    Cache::insert_page_locked(&current, &mut inner, offset, frame);
                    drop(inner);

                    let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
                    match reader.read_page(offset, &mut buf, false) {
                        Ok(_) => {
                            self.page_manager.write_bytes(frame, 0, &buf);
                            self.page_manager.with_descriptor(frame, |descriptor| {
                                descriptor.busy_reading = false;
                                descriptor.page_type = PageType::Physical;
                            });
                            self.page_manager.set_state(frame, PageState::Active);
                            break Some((frame, depth));
                        }
                        Err(error) => {
                            log::warn!(
                                "demand read failed at offset {offset:#x} in cache {}: {error:?}",
                                current.id()
                            );
                            current.remove_page(offset);
                            self.page_manager.with_descriptor(frame, |descriptor| {
                                descriptor.busy_reading = false;
                                descriptor.page_type = PageType::Physical;
                            });
                            self.page_manager.free(frame);
                            return Err(VmError::Io);
                        }
                    }
                }

                let source = inner.source.clone();
                drop(inner);
                match source {
                    Some(next) => {
                        current = next;
                        depth += 1;
                    }
                    None => break None,
                }
            };

            match found {
                Some((frame, 0)) => return Ok(FaultPage::Tracked { frame }),
                Some((frame, _)) if !write => {
                    // Read from an inherited page; it stays in the ancestor
                    // and gets mapped without write permission.
                    return Ok(FaultPage::Tracked { frame });
                }
                Some((ancestor_frame, _)) => {
                    // Copy-on-write: give the top cache a private copy.
                    let mut top_inner = top.lock();
                    if top_inner.pages.contains_key(&index) {
                        // Someone else copied up first; start over.
                        drop(top_inner);
                        continue 'retry;
                    }
                    let window = top_inner.window();
                    top_inner.store.fault(offset, window)?;
                    let frame = self.page_manager.allocate(false)?;
                    self.page_manager.copy_frame(ancestor_frame, frame);
                    Cache::insert_page_locked(top, &mut top_inner, offset, frame);
                    return Ok(FaultPage::Tracked { frame });
                }
                None => {
                    // Chain exhausted; let the top store decide.
                    let mut top_inner = top.lock();
                    if let Some(&frame) = top_inner.pages.get(&index) {
                        let busy = self.page_manager.with_descriptor(frame, |d| d.is_busy());
                        if busy {
                            drop(top_inner);
                            spins += 1;
                            if spins > BUSY_WAIT_SPINS {
                                return Err(VmError::Interrupted);
                            }
                            core::hint::spin_loop();
                            continue 'retry;
                        }
                        return Ok(FaultPage::Tracked { frame });
                    }

                    let window = top_inner.window();
                    match top_inner.store.fault(offset, window)? {
                        FaultHandling::DemandZero => {
                            let frame = self.page_manager.allocate(true)?;
                            Cache::insert_page_locked(top, &mut top_inner, offset, frame);
                            return Ok(FaultPage::Tracked { frame });
                        }
                        FaultHandling::Mapped(phys) => {
                            return Ok(FaultPage::Untracked(phys));
                        }
                    }
                }
            }
        }
    }

    /// Record that `frame` is installed in `area` at `address`, replacing
    /// a previous record at the same address (a copied-up page)
    pub(crate) fn record_mapping(
        &self,
        area: &Arc<Area>,
        frame: u64,
        address: VirtAddr,
    ) -> MappingOutcome {
        let mut area_inner = area.lock();

        let mut stale = None;
        for &id in &area_inner.mappings {
            let Some(record) = self.mappings.get(id) else {
                continue;
            };
            if record.address == address {
                if record.frame == frame {
                    return MappingOutcome::Existing;
                }
                stale = Some((id, record.frame));
                break;
            }
        }

        let mut outcome = MappingOutcome::New;
        if let Some((id, old_frame)) = stale {
            self.mappings.remove(id);
            area_inner.mappings.retain(|&m| m != id);
            self.page_manager.with_descriptor(old_frame, |descriptor| {
                descriptor.mappings.retain(|&m| m != id);
            });
            outcome = MappingOutcome::Replaced { old_frame };
        }

        let id = self.mappings.insert(MappingRecord {
            frame,
            area: area.id(),
            address,
        });
        area_inner.mappings.push(id);
        self.page_manager.with_descriptor(frame, |descriptor| {
            descriptor.mappings.push(id);
        });
        outcome
    }
}

/// What [`Vm::record_mapping`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingOutcome {
    /// The identical record was already present
    Existing,
    /// A fresh record was inserted
    New,
    /// The record at this address pointed at another frame and was replaced
    Replaced {
        /// The frame the old record pointed at
        old_frame: u64,
    },
}
