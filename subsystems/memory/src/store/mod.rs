//! # Backing Stores
//!
//! A store is the backing-storage policy behind a cache. The four variants
//! are a closed set dispatched as a tagged enum; the fault path stays
//! monomorphic and the only open-ended surface is the [`Vnode`] trait a
//! filesystem hands in.

pub mod anonymous;
pub mod device;
pub mod null;
pub mod vnode;

pub use anonymous::{AnonymousStore, StackGrowth};
pub use device::DeviceStore;
pub use null::NullStore;
pub use vnode::{MemoryVnode, Vnode, VnodeReader, VnodeStore};

use crate::{VmError, VmResult};
use vireo_hal::PhysAddr;

/// The offset window a cache is responsible for, passed to store hooks
#[derive(Debug, Clone, Copy)]
pub struct CacheWindow {
    /// First byte offset of the window
    pub base: u64,
    /// Window length in bytes
    pub size: u64,
}

/// What the store decided about a fault it was asked to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultHandling {
    /// The store has no page; the VM should install a demand-zero page
    DemandZero,
    /// The store knows the frame; the VM installs this translation directly
    Mapped(PhysAddr),
}

/// A cache's backing store
pub enum Store {
    /// Demand-zero memory with commit accounting
    Anonymous(AnonymousStore),
    /// Pages read from and written to a file-like object
    Vnode(VnodeStore),
    /// A fixed window of physical address space
    Device(DeviceStore),
    /// No pages can ever exist
    Null(NullStore),
}

impl Store {
    /// Bytes currently reserved on behalf of this store
    pub fn committed_size(&self) -> u64 {
        match self {
            Store::Anonymous(store) => store.committed_size(),
            Store::Vnode(store) => store.committed_size(),
            Store::Device(_) | Store::Null(_) => 0,
        }
    }

    /// Commit `size` bytes (an absolute end offset) to the store
    pub fn commit(&mut self, size: u64, window: CacheWindow) -> VmResult<()> {
        match self {
            Store::Anonymous(store) => store.commit(size, window),
            Store::Vnode(store) => {
                store.set_committed(size);
                Ok(())
            }
            Store::Device(_) | Store::Null(_) => Ok(()),
        }
    }

    /// Whether the store can provide data for the page at `offset`
    pub fn has_page(&self, offset: u64) -> bool {
        match self {
            Store::Anonymous(_) => false,
            Store::Vnode(store) => store.has_page(offset),
            Store::Device(_) | Store::Null(_) => false,
        }
    }

    /// Read page data at `offset` into `buf`
    pub fn read(&self, offset: u64, buf: &mut [u8], fs_reenter: bool) -> VmResult<usize> {
        match self {
            Store::Vnode(store) => store.read(offset, buf, fs_reenter),
            // Nothing to read from; the caller should have checked has_page.
            Store::Anonymous(_) | Store::Device(_) | Store::Null(_) => Err(VmError::Io),
        }
    }

    /// Write page data at `offset` from `buf`
    pub fn write(&self, offset: u64, buf: &[u8], fs_reenter: bool) -> VmResult<usize> {
        match self {
            Store::Vnode(store) => store.write(offset, buf, fs_reenter),
            // No place to write; the page scanner skips such stores.
            Store::Anonymous(_) | Store::Device(_) | Store::Null(_) => Err(VmError::Io),
        }
    }

    /// Resolve a fault at `offset` the chain walk could not satisfy
    pub fn fault(&mut self, offset: u64, window: CacheWindow) -> VmResult<FaultHandling> {
        match self {
            Store::Anonymous(store) => store.fault(offset, window),
            Store::Vnode(_) => Ok(FaultHandling::DemandZero),
            Store::Device(store) => Ok(FaultHandling::Mapped(store.frame_at(offset))),
            Store::Null(_) => Err(VmError::BadAddress),
        }
    }

    /// Whether modified pages can be written back to this store
    pub fn supports_writeback(&self) -> bool {
        matches!(self, Store::Vnode(_))
    }

    /// A detached page reader, for stores that read from real backing
    pub fn reader(&self) -> Option<VnodeReader> {
        match self {
            Store::Vnode(store) => Some(store.reader()),
            Store::Anonymous(_) | Store::Device(_) | Store::Null(_) => None,
        }
    }

    /// The range within `window` that must never be paged in, if any
    pub fn guard_range(&self, window: CacheWindow) -> Option<(u64, u64)> {
        match self {
            Store::Anonymous(store) => store.guard_range(window),
            Store::Vnode(_) | Store::Device(_) | Store::Null(_) => None,
        }
    }
}
