//! # Page Mappings
//!
//! A mapping record ties one page to one area at a specific virtual address,
//! enabling reverse lookup from a page to every address it is installed at.
//! Records are drawn from a pooled arena and referenced by index from both
//! the page's and the area's mapping lists.

use crate::AreaId;
use alloc::vec::Vec;
use spin::Mutex;
use vireo_hal::VirtAddr;

/// Index of a mapping record in the pool
pub type MappingId = u32;

/// One page-to-area link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    /// Frame number of the mapped page
    pub frame: u64,
    /// Area the page is installed in
    pub area: AreaId,
    /// Virtual address of the installed translation
    pub address: VirtAddr,
}

struct PoolInner {
    slots: Vec<Option<MappingRecord>>,
    free: Vec<MappingId>,
}

/// Arena of mapping records
pub struct MappingPool {
    inner: Mutex<PoolInner>,
}

impl MappingPool {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Insert a record, returning its id
    pub fn insert(&self, record: MappingRecord) -> MappingId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free.pop() {
            inner.slots[id as usize] = Some(record);
            id
        } else {
            let id = inner.slots.len() as MappingId;
            inner.slots.push(Some(record));
            id
        }
    }

    /// Remove a record by id
    pub fn remove(&self, id: MappingId) -> Option<MappingRecord> {
        let mut inner = self.inner.lock();
        let record = inner.slots.get_mut(id as usize)?.take();
        if record.is_some() {
            inner.free.push(id);
        }
        record
    }

    /// Copy of the record at `id`, if live
    pub fn get(&self, id: MappingId) -> Option<MappingRecord> {
        self.inner.lock().slots.get(id as usize).copied().flatten()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Whether the pool holds no live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MappingPool {
    fn default() -> Self {
        Self::new()
    }
}
