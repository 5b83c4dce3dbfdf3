//! # Physical Page Management
//!
//! One descriptor per frame of physical memory, a set of state queues, and
//! the operations that move pages between them. The descriptor array is
//! permanent; frames are identified by index.
//!
//! Lock order within this module: a frame's descriptor lock is taken before
//! any queue lock, and when a transition touches two queues they are taken
//! in state-index order.

pub mod queue;
pub mod scanner;

use crate::cache::Cache;
use crate::mapping::MappingId;
use crate::{VmError, VmResult, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::sync::Weak;
use alloc::vec;
use alloc::vec::Vec;
use queue::PageQueue;
use spin::Mutex;

/// Page states; each has a queue of the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Mapped and recently used
    Active,
    /// Mapped but idle, candidate for reclaim
    Inactive,
    /// Under transition (I/O in flight, being set up)
    Busy,
    /// Dirty with respect to its store
    Modified,
    /// Unowned, contents undefined
    Free,
    /// Unowned and zero-filled
    Clear,
    /// Pinned, never reclaimed
    Wired,
    /// Not part of the managed pool
    Unused,
}

impl PageState {
    pub(crate) const COUNT: usize = 8;

    pub(crate) fn queue_index(self) -> usize {
        match self {
            PageState::Active => 0,
            PageState::Inactive => 1,
            PageState::Busy => 2,
            PageState::Modified => 3,
            PageState::Free => 4,
            PageState::Clear => 5,
            PageState::Wired => 6,
            PageState::Unused => 7,
        }
    }
}

/// Page descriptor type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// An ordinary frame of RAM
    Physical,
    /// Placeholder while a real page is being read in
    Dummy,
    /// Reserved marker, never mapped
    Guard,
}

/// Descriptor for one frame of physical memory.
///
/// The contents buffer models the frame itself so the subsystem can run
/// hosted; on hardware it would be the frame at `frame * PAGE_SIZE`.
pub struct PageDescriptor {
    pub(crate) state: PageState,
    pub(crate) page_type: PageType,
    pub(crate) cache: Weak<Cache>,
    /// Offset within the owning cache, in page units
    pub(crate) cache_offset: u64,
    pub(crate) wired_count: u16,
    pub(crate) usage_count: i8,
    pub(crate) busy_reading: bool,
    pub(crate) busy_writing: bool,
    pub(crate) mappings: Vec<MappingId>,
    contents: Box<[u8]>,
}

impl PageDescriptor {
    fn new() -> Self {
        Self {
            state: PageState::Free,
            page_type: PageType::Physical,
            cache: Weak::new(),
            cache_offset: 0,
            wired_count: 0,
            usage_count: 0,
            busy_reading: false,
            busy_writing: false,
            mappings: Vec::new(),
            contents: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    /// Current state
    pub fn state(&self) -> PageState {
        self.state
    }

    /// The cache owning this page, if any
    pub fn cache(&self) -> Option<alloc::sync::Arc<Cache>> {
        self.cache.upgrade()
    }

    /// Offset within the owning cache, page units
    pub fn cache_offset(&self) -> u64 {
        self.cache_offset
    }

    /// Whether any I/O is in flight on the page
    pub fn is_busy(&self) -> bool {
        self.state == PageState::Busy || self.busy_reading || self.busy_writing
    }

    /// Ids of the mapping records referencing this page
    pub fn mappings(&self) -> &[MappingId] {
        &self.mappings
    }

    /// Frame contents
    pub fn bytes(&self) -> &[u8] {
        &self.contents
    }

    /// Frame contents, writable
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.contents
    }
}

/// The physical page manager: descriptor arena plus state queues.
pub struct PageManager {
    frames: Vec<Mutex<PageDescriptor>>,
    queues: [Mutex<PageQueue>; PageState::COUNT],
}

impl PageManager {
    /// Create a manager for `total_pages` frames, all initially free
    pub fn new(total_pages: u64) -> Self {
        let mut frames = Vec::with_capacity(total_pages as usize);
        for _ in 0..total_pages {
            frames.push(Mutex::new(PageDescriptor::new()));
        }

        let queues = core::array::from_fn(|_| Mutex::new(PageQueue::new()));
        let manager = Self { frames, queues };

        {
            let mut free = manager.queues[PageState::Free.queue_index()].lock();
            for frame in 0..total_pages {
                free.push(frame);
            }
        }

        manager
    }

    /// Number of frames managed
    pub fn total_pages(&self) -> u64 {
        self.frames.len() as u64
    }

    /// Pages currently on the queue of `state`
    pub fn queue_len(&self, state: PageState) -> usize {
        self.queues[state.queue_index()].lock().len()
    }

    /// Pages immediately allocatable (free + clear)
    pub fn unowned_pages(&self) -> u64 {
        (self.queue_len(PageState::Free) + self.queue_len(PageState::Clear)) as u64
    }

    /// Snapshot of the frames on the queue of `state`, head first
    pub fn queue_frames(&self, state: PageState) -> Vec<u64> {
        self.queues[state.queue_index()].lock().frames().collect()
    }

    /// Allocate a page in the active state.
    ///
    /// When `clear` is requested the page is guaranteed zero-filled, taken
    /// from the clear queue when possible and zeroed on demand otherwise.
    pub fn allocate(&self, clear: bool) -> VmResult<u64> {
        let (first, second) = if clear {
            (PageState::Clear, PageState::Free)
        } else {
            (PageState::Free, PageState::Clear)
        };

        let (frame, taken_from) = match self.pop_queue(first) {
            Some(frame) => (frame, first),
            None => match self.pop_queue(second) {
                Some(frame) => (frame, second),
                None => return Err(VmError::OutOfMemory),
            },
        };

        let mut descriptor = self.frames[frame as usize].lock();
        debug_assert_eq!(descriptor.state, taken_from);
        if clear && taken_from == PageState::Free {
            descriptor.contents.fill(0);
        }
        descriptor.state = PageState::Active;
        descriptor.page_type = PageType::Physical;
        descriptor.usage_count = 1;
        self.queues[PageState::Active.queue_index()]
            .lock()
            .push(frame);

        Ok(frame)
    }

    /// Allocate `count` physically consecutive pages in the active state.
    ///
    /// Both unowned queues stay locked during the scan so the chosen run
    /// cannot be raced away.
    pub fn allocate_contiguous(&self, count: usize, clear: bool) -> VmResult<Vec<u64>> {
        if count == 0 {
            return Err(VmError::BadValue);
        }
        let total = self.frames.len();
        if count > total {
            return Err(VmError::OutOfMemory);
        }

        let run = {
            let mut free_queue = self.queues[PageState::Free.queue_index()].lock();
            let mut clear_queue = self.queues[PageState::Clear.queue_index()].lock();

            let mut found = None;
            'scan: for start in 0..=(total - count) {
                for frame in start as u64..(start + count) as u64 {
                    if !free_queue.contains(frame) && !clear_queue.contains(frame) {
                        continue 'scan;
                    }
                }
                found = Some(start as u64);
                break;
            }
            let Some(start) = found else {
                return Err(VmError::OutOfMemory);
            };

            for frame in start..start + count as u64 {
                if !free_queue.remove(frame) {
                    clear_queue.remove(frame);
                }
            }
            start..start + count as u64
        };

        let frames: Vec<u64> = run.collect();
        for &frame in &frames {
            let mut descriptor = self.frames[frame as usize].lock();
            if clear && descriptor.state == PageState::Free {
                descriptor.contents.fill(0);
            }
            descriptor.state = PageState::Active;
            descriptor.page_type = PageType::Physical;
            descriptor.usage_count = 1;
            self.queues[PageState::Active.queue_index()]
                .lock()
                .push(frame);
        }

        Ok(frames)
    }

    /// Return a page to the free queue.
    ///
    /// The caller must have detached it from its cache and removed every
    /// mapping record first.
    pub fn free(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        debug_assert_eq!(descriptor.wired_count, 0);
        debug_assert!(descriptor.mappings.is_empty());

        descriptor.cache = Weak::new();
        descriptor.cache_offset = 0;
        descriptor.busy_reading = false;
        descriptor.busy_writing = false;
        descriptor.page_type = PageType::Physical;
        descriptor.usage_count = 0;
        self.move_queues(&mut descriptor, frame, PageState::Free);
    }

    /// Move a page to a new state, updating the queues
    pub fn set_state(&self, frame: u64, state: PageState) {
        let mut descriptor = self.frames[frame as usize].lock();
        self.move_queues(&mut descriptor, frame, state);
    }

    /// Pin a page; wired pages are never reclaimed
    pub fn wire(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        descriptor.wired_count += 1;
        if descriptor.wired_count == 1 {
            self.move_queues(&mut descriptor, frame, PageState::Wired);
        }
    }

    /// Drop one wiring; the page becomes active again on the last one
    pub fn unwire(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        debug_assert!(descriptor.wired_count > 0);
        descriptor.wired_count -= 1;
        if descriptor.wired_count == 0 {
            self.move_queues(&mut descriptor, frame, PageState::Active);
        }
    }

    /// Mark a page dirty with respect to its store
    pub fn mark_modified(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        if descriptor.wired_count > 0 {
            return;
        }
        self.move_queues(&mut descriptor, frame, PageState::Modified);
    }

    /// Usage hint: the page was touched
    pub fn mark_active(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        descriptor.usage_count = descriptor.usage_count.saturating_add(1);
        if descriptor.state == PageState::Inactive {
            self.move_queues(&mut descriptor, frame, PageState::Active);
        }
    }

    /// Usage hint: the page is a reclaim candidate
    pub fn mark_inactive(&self, frame: u64) {
        let mut descriptor = self.frames[frame as usize].lock();
        if descriptor.state == PageState::Active {
            self.move_queues(&mut descriptor, frame, PageState::Inactive);
        }
    }

    /// Run `f` with the descriptor of `frame` locked
    pub fn with_descriptor<R>(&self, frame: u64, f: impl FnOnce(&mut PageDescriptor) -> R) -> R {
        let mut descriptor = self.frames[frame as usize].lock();
        f(&mut descriptor)
    }

    /// Copy out of a frame at a byte offset
    pub fn read_bytes(&self, frame: u64, offset: u64, buf: &mut [u8]) {
        let descriptor = self.frames[frame as usize].lock();
        let start = offset as usize;
        buf.copy_from_slice(&descriptor.contents[start..start + buf.len()]);
    }

    /// Copy into a frame at a byte offset
    pub fn write_bytes(&self, frame: u64, offset: u64, buf: &[u8]) {
        let mut descriptor = self.frames[frame as usize].lock();
        let start = offset as usize;
        descriptor.contents[start..start + buf.len()].copy_from_slice(buf);
    }

    /// Copy one frame's contents into another
    pub fn copy_frame(&self, source: u64, target: u64) {
        debug_assert_ne!(source, target);
        // Frame indices are distinct, so the two locks never alias.
        let source_descriptor = self.frames[source as usize].lock();
        let mut target_descriptor = self.frames[target as usize].lock();
        target_descriptor
            .contents
            .copy_from_slice(&source_descriptor.contents);
    }

    /// Zero some free pages, moving them to the clear queue.
    /// Returns how many were cleared.
    pub fn clear_some(&self, max: usize) -> usize {
        let mut cleared = 0;
        while cleared < max {
            let Some(frame) = self.pop_queue(PageState::Free) else {
                break;
            };
            let mut descriptor = self.frames[frame as usize].lock();
            debug_assert_eq!(descriptor.state, PageState::Free);
            descriptor.contents.fill(0);
            descriptor.state = PageState::Clear;
            self.queues[PageState::Clear.queue_index()]
                .lock()
                .push(frame);
            cleared += 1;
        }
        cleared
    }

    fn pop_queue(&self, state: PageState) -> Option<u64> {
        self.queues[state.queue_index()].lock().pop()
    }

    /// Update the queues for a state change. The descriptor lock is held;
    /// both queue locks are taken in state-index order.
    fn move_queues(&self, descriptor: &mut PageDescriptor, frame: u64, new_state: PageState) {
        let old_state = descriptor.state;
        if old_state == new_state {
            return;
        }
        descriptor.state = new_state;

        let old_index = old_state.queue_index();
        let new_index = new_state.queue_index();
        if old_index < new_index {
            let mut old_queue = self.queues[old_index].lock();
            let mut new_queue = self.queues[new_index].lock();
            old_queue.remove(frame);
            new_queue.push(frame);
        } else {
            let mut new_queue = self.queues[new_index].lock();
            let mut old_queue = self.queues[old_index].lock();
            old_queue.remove(frame);
            new_queue.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_round_trip() {
        let manager = PageManager::new(4);
        assert_eq!(manager.unowned_pages(), 4);

        let frame = manager.allocate(false).unwrap();
        assert_eq!(manager.queue_len(PageState::Active), 1);
        assert_eq!(manager.unowned_pages(), 3);

        manager.free(frame);
        assert_eq!(manager.unowned_pages(), 4);
        assert_eq!(manager.queue_len(PageState::Active), 0);
    }

    #[test]
    fn test_allocate_clear_zeroes_dirty_frames() {
        let manager = PageManager::new(1);
        let frame = manager.allocate(false).unwrap();
        manager.write_bytes(frame, 0, &[0xaa; 16]);
        manager.free(frame);

        let frame = manager.allocate(true).unwrap();
        let mut buf = [0xffu8; 16];
        manager.read_bytes(frame, 0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_exhaustion_reports_out_of_memory() {
        let manager = PageManager::new(2);
        let _a = manager.allocate(false).unwrap();
        let _b = manager.allocate(false).unwrap();
        assert_eq!(manager.allocate(false), Err(VmError::OutOfMemory));
    }

    #[test]
    fn test_wire_and_unwire_move_queues() {
        let manager = PageManager::new(2);
        let frame = manager.allocate(false).unwrap();
        manager.wire(frame);
        assert_eq!(manager.queue_len(PageState::Wired), 1);
        // A second wiring nests
        manager.wire(frame);
        manager.unwire(frame);
        assert_eq!(manager.queue_len(PageState::Wired), 1);
        manager.unwire(frame);
        assert_eq!(manager.queue_len(PageState::Active), 1);
    }

    #[test]
    fn test_usage_hints() {
        let manager = PageManager::new(1);
        let frame = manager.allocate(false).unwrap();
        manager.mark_inactive(frame);
        assert_eq!(manager.queue_len(PageState::Inactive), 1);
        manager.mark_active(frame);
        assert_eq!(manager.queue_len(PageState::Active), 1);
        assert!(manager.with_descriptor(frame, |d| d.usage_count) >= 1);
    }

    #[test]
    fn test_allocate_contiguous_finds_a_run() {
        let manager = PageManager::new(8);
        // Fragment the pool: leave frame 3 occupied mid-run.
        let a = manager.allocate(false).unwrap();
        let b = manager.allocate(false).unwrap();
        manager.free(a);
        let c = manager.allocate(false).unwrap();
        let _hold = manager.allocate(false).unwrap();
        manager.free(b);
        manager.free(c);

        let run = manager.allocate_contiguous(4, true).unwrap();
        assert_eq!(run.len(), 4);
        for pair in run.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert_eq!(manager.allocate_contiguous(4, false), Err(VmError::OutOfMemory));
    }

    #[test]
    fn test_clear_some_moves_to_clear_queue() {
        let manager = PageManager::new(4);
        assert_eq!(manager.clear_some(3), 3);
        assert_eq!(manager.queue_len(PageState::Clear), 3);
        assert_eq!(manager.queue_len(PageState::Free), 1);
    }
}
