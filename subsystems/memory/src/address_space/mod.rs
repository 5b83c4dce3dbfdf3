//! # Address Spaces
//!
//! An address space is the window of virtual addresses visible to one team
//! (or the kernel), its ordered collection of areas, and the translation
//! map backing it. Structural changes happen under the write lock; lookups
//! and faults take the read lock.

pub mod registry;

pub use registry::AddressSpaceRegistry;

use crate::area::{AddressSpec, Area};
use crate::{TeamId, VmError, VmResult, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;
use vireo_hal::mmu::TranslationMap;
use vireo_hal::VirtAddr;

/// Base of the kernel address window
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;
/// Size of the kernel address window
pub const KERNEL_SIZE: u64 = 1 << 39;
/// Base of the user address window; the low megabyte stays unmapped
pub const USER_BASE: u64 = 0x0010_0000;
/// One past the top of the user address window
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;
/// Size of the user address window
pub const USER_SIZE: u64 = USER_TOP - USER_BASE;

/// Alignment for block-aligned kernel placements
pub const KERNEL_BLOCK_SIZE: u64 = 16 * PAGE_SIZE;

/// Kernel or user variant of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspaceKind {
    /// The kernel's single address space
    Kernel,
    /// A team's address space
    User,
}

struct AspaceInner {
    areas: BTreeMap<u64, Arc<Area>>,
    free_space: u64,
    deleting: bool,
}

/// One team's (or the kernel's) virtual address space
pub struct AddressSpace {
    id: TeamId,
    kind: AspaceKind,
    base: VirtAddr,
    size: u64,
    translation_map: Box<dyn TranslationMap>,
    inner: RwLock<AspaceInner>,
    fault_count: AtomicU64,
    change_count: AtomicU64,
}

impl AddressSpace {
    /// Create an address space over `[base, base + size)` with the given
    /// translation map
    pub fn new(
        id: TeamId,
        kind: AspaceKind,
        base: VirtAddr,
        size: u64,
        translation_map: Box<dyn TranslationMap>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            base,
            size,
            translation_map,
            inner: RwLock::new(AspaceInner {
                areas: BTreeMap::new(),
                free_space: size,
                deleting: false,
            }),
            fault_count: AtomicU64::new(0),
            change_count: AtomicU64::new(0),
        })
    }

    /// The owning team's id
    pub fn id(&self) -> TeamId {
        self.id
    }

    /// Kernel or user variant
    pub fn kind(&self) -> AspaceKind {
        self.kind
    }

    /// First address of the window
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// One past the last address of the window
    pub fn end(&self) -> VirtAddr {
        self.base.add(self.size)
    }

    /// Window size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The translation map backing this space
    pub fn translation_map(&self) -> &dyn TranslationMap {
        &*self.translation_map
    }

    /// Bytes not covered by any area
    pub fn free_space(&self) -> u64 {
        self.inner.read().free_space
    }

    /// Number of areas
    pub fn area_count(&self) -> usize {
        self.inner.read().areas.len()
    }

    /// Faults resolved against this space
    pub fn fault_count(&self) -> u64 {
        self.fault_count.load(Ordering::Relaxed)
    }

    pub(crate) fn count_fault(&self) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Structural mutations so far
    pub fn change_count(&self) -> u64 {
        self.change_count.load(Ordering::Relaxed)
    }

    /// Whether the space is being torn down
    pub fn is_deleting(&self) -> bool {
        self.inner.read().deleting
    }

    /// Mark the space as going away; no new areas can be created after this
    pub fn mark_deleting(&self) {
        self.inner.write().deleting = true;
    }

    /// Find the area containing `addr` by binary search over the ordered
    /// collection
    pub fn find_area(&self, addr: VirtAddr) -> Option<Arc<Area>> {
        let inner = self.inner.read();
        let (_, area) = inner.areas.range(..=addr.as_u64()).next_back()?;
        if area.contains(addr) {
            Some(area.clone())
        } else {
            None
        }
    }

    /// Snapshot of the areas in ascending base order
    pub fn areas(&self) -> Vec<Arc<Area>> {
        self.inner.read().areas.values().cloned().collect()
    }

    /// Place and insert a new area under one hold of the write lock.
    ///
    /// `build` constructs the area once a base address has been chosen; the
    /// constructed area must use exactly that base.
    pub fn create_area_in(
        &self,
        spec: AddressSpec,
        size: u64,
        build: impl FnOnce(VirtAddr) -> Arc<Area>,
    ) -> VmResult<Arc<Area>> {
        let mut inner = self.inner.write();
        if inner.deleting {
            return Err(VmError::WouldDelete);
        }

        let base = self.find_gap(&inner.areas, spec, size)?;
        let area = build(base);
        debug_assert_eq!(area.base(), base);
        inner.areas.insert(base.as_u64(), area.clone());
        inner.free_space -= size;
        self.change_count.fetch_add(1, Ordering::Relaxed);

        Ok(area)
    }

    /// Insert an existing area; fails on overlap
    pub fn insert_area(&self, area: &Arc<Area>) -> VmResult<()> {
        let size = area.size();
        let mut inner = self.inner.write();
        if inner.deleting {
            return Err(VmError::WouldDelete);
        }
        if !self.range_free(&inner.areas, area.base(), size) {
            return Err(VmError::BadValue);
        }
        inner.areas.insert(area.base().as_u64(), area.clone());
        inner.free_space -= size;
        self.change_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove the area based at `base`
    pub fn remove_area(&self, base: VirtAddr) -> Option<Arc<Area>> {
        let mut inner = self.inner.write();
        let area = inner.areas.remove(&base.as_u64())?;
        inner.free_space += area.size();
        self.change_count.fetch_add(1, Ordering::Relaxed);
        Some(area)
    }

    /// Account an in-place size change of `area` (the area list key is its
    /// base, which never moves)
    pub(crate) fn resize_area_accounting(&self, old_size: u64, new_size: u64) {
        let mut inner = self.inner.write();
        inner.free_space = inner.free_space + old_size - new_size;
        self.change_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether growing the area based at `base` to `new_size` collides with
    /// a neighbor or the window end
    pub fn can_grow_area(&self, base: VirtAddr, new_size: u64) -> bool {
        let Some(new_end) = base.checked_add(new_size) else {
            return false;
        };
        if new_end > self.end() {
            return false;
        }
        let inner = self.inner.read();
        match inner.areas.range(base.as_u64() + 1..).next() {
            Some((&next_base, _)) => new_end.as_u64() <= next_base,
            None => true,
        }
    }

    fn range_free(&self, areas: &BTreeMap<u64, Arc<Area>>, base: VirtAddr, size: u64) -> bool {
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        if base < self.base || end > self.end() {
            return false;
        }
        // The nearest area at or below the base must end before it...
        if let Some((_, area)) = areas.range(..=base.as_u64()).next_back() {
            if area.end() > base {
                return false;
            }
        }
        // ...and the next area above must start at or after the end.
        if let Some((&next_base, _)) = areas.range(base.as_u64() + 1..).next() {
            if next_base < end.as_u64() {
                return false;
            }
        }
        true
    }

    /// Scan for the lowest gap satisfying `spec`; ties break low-address
    /// first
    fn find_gap(
        &self,
        areas: &BTreeMap<u64, Arc<Area>>,
        spec: AddressSpec,
        size: u64,
    ) -> VmResult<VirtAddr> {
        let align = match spec {
            AddressSpec::KernelBlockAligned => {
                if self.kind != AspaceKind::Kernel {
                    return Err(VmError::BadValue);
                }
                KERNEL_BLOCK_SIZE
            }
            _ => PAGE_SIZE,
        };

        let mut cursor = match spec {
            AddressSpec::Exact(base) => {
                if !base.is_aligned(PAGE_SIZE) {
                    return Err(VmError::BadValue);
                }
                return if self.range_free(areas, base, size) {
                    Ok(base)
                } else {
                    Err(VmError::BadValue)
                };
            }
            AddressSpec::Any | AddressSpec::KernelBlockAligned => self.base,
            AddressSpec::AnyAbove(min) => {
                if min > self.base {
                    min.align_up(PAGE_SIZE)
                } else {
                    self.base
                }
            }
        };
        cursor = cursor.align_up(align);

        // The cursor may start inside an area whose base lies below it.
        if let Some((_, below)) = areas.range(..=cursor.as_u64()).next_back() {
            if below.end() > cursor {
                cursor = below.end().align_up(align);
            }
        }

        for (&area_base, area) in areas.range(cursor.as_u64()..) {
            if cursor.as_u64() + size <= area_base {
                return Ok(cursor);
            }
            let after = VirtAddr::new(area_base).add(area.size());
            if after > cursor {
                cursor = after.align_up(align);
            }
        }

        if cursor.checked_add(size).is_some_and(|end| end <= self.end()) {
            Ok(cursor)
        } else {
            Err(VmError::OutOfMemory)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{AreaProtection, AreaWiring};
    use crate::cache::{Cache, CacheType};
    use crate::commit::CommitAccounting;
    use crate::page::PageManager;
    use crate::store::{AnonymousStore, StackGrowth, Store};
    use vireo_hal::arch_stubs::SoftTranslationMap;

    fn user_space() -> Arc<AddressSpace> {
        AddressSpace::new(
            2,
            AspaceKind::User,
            VirtAddr::new(USER_BASE),
            USER_SIZE,
            Box::new(SoftTranslationMap::new()),
        )
    }

    fn test_area(space: &Arc<AddressSpace>, id: crate::AreaId, base: VirtAddr, size: u64) -> Arc<Area> {
        let page_manager = Arc::new(PageManager::new(4));
        let store = Store::Anonymous(AnonymousStore::new(
            Arc::new(CommitAccounting::new(1 << 30)),
            true,
            0,
            0,
            StackGrowth::Downward,
        ));
        let cache = Cache::new(page_manager, store, CacheType::Ram, 0, size, true);
        Area::new(
            id,
            "test",
            base,
            size,
            AreaProtection::USER_RW,
            AreaWiring::NoLock,
            cache,
            0,
            space,
        )
    }

    #[test]
    fn test_placement_scans_lowest_gap_first() {
        let space = user_space();
        let a = space
            .create_area_in(AddressSpec::Any, 0x4000, |base| {
                test_area(&space, 1, base, 0x4000)
            })
            .unwrap();
        assert_eq!(a.base().as_u64(), USER_BASE);

        let b = space
            .create_area_in(AddressSpec::Any, 0x2000, |base| {
                test_area(&space, 2, base, 0x2000)
            })
            .unwrap();
        assert_eq!(b.base().as_u64(), USER_BASE + 0x4000);

        // Delete the first area; the gap is reused for anything that fits.
        space.remove_area(a.base());
        let c = space
            .create_area_in(AddressSpec::Any, 0x1000, |base| {
                test_area(&space, 3, base, 0x1000)
            })
            .unwrap();
        assert_eq!(c.base().as_u64(), USER_BASE);
    }

    #[test]
    fn test_exact_placement_rejects_overlap() {
        let space = user_space();
        let base = VirtAddr::new(USER_BASE + 0x10000);
        space
            .create_area_in(AddressSpec::Exact(base), 0x4000, |b| {
                test_area(&space, 1, b, 0x4000)
            })
            .unwrap();

        let clash = space.create_area_in(AddressSpec::Exact(VirtAddr::new(USER_BASE + 0x12000)), 0x4000, |b| {
            test_area(&space, 2, b, 0x4000)
        });
        assert_eq!(clash.err(), Some(VmError::BadValue));
    }

    #[test]
    fn test_any_above_respects_floor() {
        let space = user_space();
        let floor = VirtAddr::new(USER_BASE + 0x100000);
        let area = space
            .create_area_in(AddressSpec::AnyAbove(floor), 0x2000, |b| {
                test_area(&space, 1, b, 0x2000)
            })
            .unwrap();
        assert!(area.base() >= floor);
    }

    #[test]
    fn test_find_area_uses_half_open_ranges() {
        let space = user_space();
        let area = space
            .create_area_in(AddressSpec::Any, 0x4000, |b| test_area(&space, 1, b, 0x4000))
            .unwrap();

        assert!(space.find_area(area.base()).is_some());
        assert!(space.find_area(area.base().add(0x3fff)).is_some());
        assert!(space.find_area(area.end()).is_none());
    }

    #[test]
    fn test_insert_existing_area_checks_overlap() {
        let space = user_space();
        let base = VirtAddr::new(USER_BASE + 0x8000);
        let area = test_area(&space, 1, base, 0x4000);
        space.insert_area(&area).unwrap();

        let overlapping = test_area(&space, 2, VirtAddr::new(USER_BASE + 0xa000), 0x4000);
        assert_eq!(space.insert_area(&overlapping).err(), Some(VmError::BadValue));
    }

    #[test]
    fn test_deleting_space_refuses_new_areas() {
        let space = user_space();
        space.mark_deleting();
        let denied = space.create_area_in(AddressSpec::Any, 0x1000, |b| {
            test_area(&space, 1, b, 0x1000)
        });
        assert_eq!(denied.err(), Some(VmError::WouldDelete));
    }

    #[test]
    fn test_free_space_accounting() {
        let space = user_space();
        let initial = space.free_space();
        let area = space
            .create_area_in(AddressSpec::Any, 0x4000, |b| test_area(&space, 1, b, 0x4000))
            .unwrap();
        assert_eq!(space.free_space(), initial - 0x4000);
        space.remove_area(area.base());
        assert_eq!(space.free_space(), initial);
    }

    #[test]
    fn test_change_counter_tracks_mutations() {
        let space = user_space();
        let before = space.change_count();
        let area = space
            .create_area_in(AddressSpec::Any, 0x1000, |b| test_area(&space, 1, b, 0x1000))
            .unwrap();
        space.remove_area(area.base());
        assert_eq!(space.change_count(), before + 2);
    }
}
