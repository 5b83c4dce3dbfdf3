//! # Areas
//!
//! An area is a named, contiguous sub-range of an address space with
//! uniform protection and backing. It references the cache that provides
//! its bytes and the offset within that cache corresponding to its base.

use crate::address_space::AddressSpace;
use crate::cache::Cache;
use crate::mapping::MappingId;
use crate::AreaId;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use vireo_hal::mmu::MapProtection;
use vireo_hal::VirtAddr;

bitflags! {
    /// Area protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaProtection: u32 {
        /// Readable from user mode
        const READ = 1 << 0;
        /// Writable from user mode
        const WRITE = 1 << 1;
        /// Executable from user mode
        const EXECUTE = 1 << 2;
        /// The area is a user stack: commit as needed, guard at the end
        const STACK = 1 << 3;
        /// Readable from kernel mode
        const KERNEL_READ = 1 << 4;
        /// Writable from kernel mode
        const KERNEL_WRITE = 1 << 5;
        /// Executable from kernel mode
        const KERNEL_EXECUTE = 1 << 6;
        /// The area is a kernel stack
        const KERNEL_STACK = 1 << 7;
        /// The area's store does not reserve memory at commit time
        const OVERCOMMIT = 1 << 12;
    }
}

impl AreaProtection {
    /// Read/write access for the kernel only
    pub const KERNEL_RW: Self = Self::KERNEL_READ.union(Self::KERNEL_WRITE);

    /// Read/write access for user mode (plus the kernel)
    pub const USER_RW: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::KERNEL_READ)
        .union(Self::KERNEL_WRITE);

    /// Whether the given access is permitted
    pub fn allows(self, kind: AccessKind, user: bool) -> bool {
        let needed = match (kind, user) {
            (AccessKind::Read, true) => Self::READ,
            (AccessKind::Write, true) => Self::WRITE,
            (AccessKind::Execute, true) => Self::EXECUTE,
            (AccessKind::Read, false) => Self::KERNEL_READ,
            (AccessKind::Write, false) => Self::KERNEL_WRITE,
            (AccessKind::Execute, false) => Self::KERNEL_EXECUTE,
        };
        self.contains(needed)
    }

    /// Whether the area is a stack of either kind
    pub fn is_stack(self) -> bool {
        self.intersects(Self::STACK | Self::KERNEL_STACK)
    }

    /// Whether any write access is permitted
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE | Self::KERNEL_WRITE)
    }

    /// Translate to translation-map protection bits. Write permission is
    /// withheld unless `grant_write` is set, so modified-page tracking and
    /// copy-on-write both see the first write as a fault.
    pub fn to_map_protection(self, grant_write: bool) -> MapProtection {
        let mut protection = MapProtection::empty();
        if self.contains(Self::READ) {
            protection |= MapProtection::USER_READ;
        }
        if self.contains(Self::EXECUTE) {
            protection |= MapProtection::USER_EXECUTE;
        }
        if self.contains(Self::KERNEL_READ) {
            protection |= MapProtection::KERNEL_READ;
        }
        if self.contains(Self::KERNEL_EXECUTE) {
            protection |= MapProtection::KERNEL_EXECUTE;
        }
        if grant_write {
            if self.contains(Self::WRITE) {
                protection |= MapProtection::USER_WRITE;
            }
            if self.contains(Self::KERNEL_WRITE) {
                protection |= MapProtection::KERNEL_WRITE;
            }
        }
        protection
    }
}

/// The kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Data read
    Read,
    /// Data write
    Write,
    /// Instruction fetch
    Execute,
}

/// How an area's pages are pinned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaWiring {
    /// Pages come and go on demand
    NoLock,
    /// Pages are wired as they are faulted in
    Lazy,
    /// All pages are faulted in and wired at creation
    Full,
    /// Like `Full`, from one physically contiguous run of frames
    Contiguous,
}

impl AreaWiring {
    /// Whether the policy pins pages
    pub fn is_wired(self) -> bool {
        !matches!(self, AreaWiring::NoLock)
    }
}

/// How a cloned area relates to the source's pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMapping {
    /// Both areas share the same cache; writes are mutually visible
    Shared,
    /// The clone gets a fresh cache chained in front of the source's, so
    /// writes on either side stay private (copy-on-write)
    Private,
}

/// Where to place a new area within its address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpec {
    /// Exactly at this base address
    Exact(VirtAddr),
    /// Anywhere; the lowest sufficient gap wins
    Any,
    /// Anywhere at or above this address
    AnyAbove(VirtAddr),
    /// Anywhere in the kernel space, aligned to the kernel block size
    KernelBlockAligned,
}

pub(crate) struct AreaInner {
    pub size: u64,
    pub protection: AreaProtection,
    pub wiring: AreaWiring,
    pub cache: Arc<Cache>,
    /// Offset within the cache corresponding to the area's base
    pub cache_offset: u64,
    pub mappings: Vec<MappingId>,
}

/// A named region of an address space
pub struct Area {
    id: AreaId,
    name: String,
    base: VirtAddr,
    memory_type: u32,
    address_space: Weak<AddressSpace>,
    inner: Mutex<AreaInner>,
}

impl Area {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AreaId,
        name: &str,
        base: VirtAddr,
        size: u64,
        protection: AreaProtection,
        wiring: AreaWiring,
        cache: Arc<Cache>,
        cache_offset: u64,
        address_space: &Arc<AddressSpace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: String::from(name),
            base,
            memory_type: 0,
            address_space: Arc::downgrade(address_space),
            inner: Mutex::new(AreaInner {
                size,
                protection,
                wiring,
                cache,
                cache_offset,
                mappings: Vec::new(),
            }),
        })
    }

    /// Area id
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// Area name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// One past the last address
    pub fn end(&self) -> VirtAddr {
        self.base.add(self.size())
    }

    /// Whether `addr` falls inside the area's half-open range
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Current protection bits
    pub fn protection(&self) -> AreaProtection {
        self.inner.lock().protection
    }

    /// Wiring policy
    pub fn wiring(&self) -> AreaWiring {
        self.inner.lock().wiring
    }

    /// Memory-type hint for the translation map
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// The cache backing the area
    pub fn cache(&self) -> Arc<Cache> {
        self.inner.lock().cache.clone()
    }

    /// Offset within the cache corresponding to the base address
    pub fn cache_offset(&self) -> u64 {
        self.inner.lock().cache_offset
    }

    /// The owning address space, while it is alive
    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.upgrade()
    }

    /// Mapping record ids contributed by this area
    pub fn mappings(&self) -> Vec<MappingId> {
        self.inner.lock().mappings.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AreaInner> {
        self.inner.lock()
    }

    /// Cache offset in bytes backing the page at `addr`
    pub fn offset_of(&self, addr: VirtAddr) -> u64 {
        debug_assert!(self.contains(addr));
        addr.page_base().as_u64() - self.base.as_u64() + self.cache_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_allows_by_mode() {
        let protection = AreaProtection::READ | AreaProtection::KERNEL_RW;
        assert!(protection.allows(AccessKind::Read, true));
        assert!(!protection.allows(AccessKind::Write, true));
        assert!(protection.allows(AccessKind::Write, false));
        assert!(!protection.allows(AccessKind::Execute, false));
    }

    #[test]
    fn test_map_protection_withholds_write() {
        let protection = AreaProtection::USER_RW;
        let read_only = protection.to_map_protection(false);
        assert!(read_only.contains(MapProtection::USER_READ));
        assert!(!read_only.contains(MapProtection::USER_WRITE));

        let writable = protection.to_map_protection(true);
        assert!(writable.contains(MapProtection::USER_WRITE));
        assert!(writable.contains(MapProtection::KERNEL_WRITE));
    }

    #[test]
    fn test_wiring_policies() {
        assert!(!AreaWiring::NoLock.is_wired());
        assert!(AreaWiring::Lazy.is_wired());
        assert!(AreaWiring::Full.is_wired());
        assert!(AreaWiring::Contiguous.is_wired());
    }
}
