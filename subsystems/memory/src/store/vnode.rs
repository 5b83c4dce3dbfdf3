//! # Vnode Store
//!
//! Backing for file-backed caches. The VM side of the contract is small: a
//! file-like object that can read and write page-sized spans at byte
//! offsets. The `fs_reenter` flag tells the filesystem the call originates
//! from inside a page fault it may itself have triggered.

use crate::{VmResult, PAGE_SIZE};
use alloc::sync::Arc;
use vireo_hal::page_align_up;

/// File-like object a filesystem hands to the VM
pub trait Vnode: Send + Sync {
    /// Current length of the object in bytes
    fn len(&self) -> u64;

    /// Whether the object is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read at `offset`, returning the number of bytes read
    fn read_at(&self, offset: u64, buf: &mut [u8], fs_reenter: bool) -> VmResult<usize>;

    /// Write at `offset`, returning the number of bytes written
    fn write_at(&self, offset: u64, buf: &[u8], fs_reenter: bool) -> VmResult<usize>;
}

/// Store reading pages from and writing pages to a vnode
pub struct VnodeStore {
    vnode: Arc<dyn Vnode>,
    committed_size: u64,
}

impl VnodeStore {
    /// Create a store over `vnode`
    pub fn new(vnode: Arc<dyn Vnode>) -> Self {
        Self {
            vnode,
            committed_size: 0,
        }
    }

    /// Bytes nominally committed; file-backed pages reserve no RAM
    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    pub(crate) fn set_committed(&mut self, size: u64) {
        self.committed_size = size;
    }

    /// Whether the vnode provides data for the page at `offset`
    pub fn has_page(&self, offset: u64) -> bool {
        offset < page_align_up(self.vnode.len())
    }

    /// A handle for reading pages without holding the cache lock
    pub fn reader(&self) -> VnodeReader {
        VnodeReader {
            vnode: self.vnode.clone(),
        }
    }

    /// Read one page's worth at `offset`; short reads are zero-filled
    pub fn read(&self, offset: u64, buf: &mut [u8], fs_reenter: bool) -> VmResult<usize> {
        debug_assert!(buf.len() as u64 <= PAGE_SIZE);
        let read = self.vnode.read_at(offset, buf, fs_reenter)?;
        buf[read..].fill(0);
        Ok(buf.len())
    }

    /// Write one page's worth at `offset`
    pub fn write(&self, offset: u64, buf: &[u8], fs_reenter: bool) -> VmResult<usize> {
        self.vnode.write_at(offset, buf, fs_reenter)
    }
}

/// A page-read handle detached from its store.
///
/// The fault path pins the target page busy, drops the cache lock and reads
/// through one of these, so concurrent faulters wait on the page rather
/// than on the cache.
#[derive(Clone)]
pub struct VnodeReader {
    vnode: Arc<dyn Vnode>,
}

impl VnodeReader {
    /// Read one page's worth at `offset`; short reads are zero-filled
    pub fn read_page(&self, offset: u64, buf: &mut [u8], fs_reenter: bool) -> VmResult<usize> {
        let read = self.vnode.read_at(offset, buf, fs_reenter)?;
        buf[read..].fill(0);
        Ok(buf.len())
    }
}

/// A vnode kept entirely in memory.
///
/// The smallest useful vnode: ramfs-style storage and the test double for
/// everything file-backed in this subsystem.
pub struct MemoryVnode {
    bytes: spin::Mutex<alloc::vec::Vec<u8>>,
}

impl MemoryVnode {
    /// Create a vnode holding a copy of `bytes`
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: spin::Mutex::new(bytes.to_vec()),
        }
    }
}

impl Vnode for MemoryVnode {
    fn len(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8], _fs_reenter: bool) -> VmResult<usize> {
        let bytes = self.bytes.lock();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let available = bytes.len() - offset;
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, offset: u64, buf: &[u8], _fs_reenter: bool) -> VmResult<usize> {
        let mut bytes = self.bytes.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}
