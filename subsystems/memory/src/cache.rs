//! # Caches
//!
//! A cache is a page-indexed container representing one logical source of
//! pages. Caches chain through their `source` link to form copy-on-write
//! ancestry: a lookup that misses in a cache continues in its source, and a
//! write to an inherited page copies it up into the top cache.
//!
//! The source graph is a DAG by construction - an existing cache only ever
//! gains a fresh, source-less cache in front of it - and a debug check
//! enforces that on every edge insertion.

use crate::area::Area;
use crate::page::PageManager;
use crate::store::{CacheWindow, Store};
use crate::{VmResult, PAGE_SIZE};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

static NEXT_CACHE_ID: AtomicU32 = AtomicU32::new(1);

/// What kind of backing a cache has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Anonymous RAM, demand-zero
    Ram,
    /// Backed by a file-like object
    Vnode,
    /// A window of physical address space
    Device,
    /// No pages can exist; reserves address space
    Null,
}

pub(crate) struct CacheInner {
    /// Owned pages: page index within the window -> frame number
    pub pages: alloc::collections::BTreeMap<u64, u64>,
    /// Copy-on-write parent
    pub source: Option<Arc<Cache>>,
    /// Caches that name this cache as their source
    pub consumers: Vec<Weak<Cache>>,
    /// Areas currently backed by this cache
    pub areas: Vec<Weak<Area>>,
    pub store: Store,
    /// First byte offset this cache is responsible for
    pub virtual_base: u64,
    /// Window length in bytes, independent of the base
    pub virtual_size: u64,
    pub temporary: bool,
    pub scan_skip: bool,
    /// Set while a structural operation (merge) is in flight
    pub busy: bool,
}

impl CacheInner {
    pub fn window(&self) -> CacheWindow {
        CacheWindow {
            base: self.virtual_base,
            size: self.virtual_size,
        }
    }

    fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.virtual_base && offset < self.virtual_base + self.virtual_size
    }
}

/// A reference-counted page container; see the module docs
pub struct Cache {
    id: u32,
    cache_type: CacheType,
    page_manager: Arc<PageManager>,
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// Create a cache over `store` covering `[virtual_base, virtual_base + virtual_size)`
    pub fn new(
        page_manager: Arc<PageManager>,
        store: Store,
        cache_type: CacheType,
        virtual_base: u64,
        virtual_size: u64,
        temporary: bool,
    ) -> Arc<Self> {
        let scan_skip = !store.supports_writeback();
        Arc::new(Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            cache_type,
            page_manager,
            inner: Mutex::new(CacheInner {
                pages: alloc::collections::BTreeMap::new(),
                source: None,
                consumers: Vec::new(),
                areas: Vec::new(),
                store,
                virtual_base,
                virtual_size,
                temporary,
                scan_skip,
                busy: false,
            }),
        })
    }

    /// Debugging id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The kind of backing
    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    /// The page manager frames of this cache live in
    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock()
    }

    /// The offset window this cache is responsible for
    pub fn window(&self) -> CacheWindow {
        self.inner.lock().window()
    }

    /// Number of owned pages
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Frame owning byte offset `offset`, if this cache has one
    pub fn lookup_page(&self, offset: u64) -> Option<u64> {
        self.inner.lock().pages.get(&(offset / PAGE_SIZE)).copied()
    }

    /// Snapshot of the owned pages as `(byte offset, frame)`, ascending
    pub fn pages(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .pages
            .iter()
            .map(|(&index, &frame)| (index * PAGE_SIZE, frame))
            .collect()
    }

    /// The copy-on-write parent, if any
    pub fn source(&self) -> Option<Arc<Cache>> {
        self.inner.lock().source.clone()
    }

    /// Live consumers of this cache
    pub fn consumer_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.consumers.retain(|weak| weak.upgrade().is_some());
        inner.consumers.len()
    }

    /// Insert an owned page at byte offset `offset`
    pub fn insert_page(this: &Arc<Cache>, offset: u64, frame: u64) {
        let mut inner = this.inner.lock();
        Self::insert_page_locked(this, &mut inner, offset, frame);
    }

    pub(crate) fn insert_page_locked(
        this: &Arc<Cache>,
        inner: &mut CacheInner,
        offset: u64,
        frame: u64,
    ) {
        debug_assert!(inner.contains_offset(offset));
        let index = offset / PAGE_SIZE;
        let previous = inner.pages.insert(index, frame);
        debug_assert!(previous.is_none(), "double insert at cache offset");
        this.page_manager.with_descriptor(frame, |descriptor| {
            descriptor.cache = Arc::downgrade(this);
            descriptor.cache_offset = index;
        });
    }

    /// Take the page at byte offset `offset` out of the cache without
    /// freeing it
    pub fn remove_page(&self, offset: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let frame = inner.pages.remove(&(offset / PAGE_SIZE))?;
        self.page_manager.with_descriptor(frame, |descriptor| {
            descriptor.cache = Weak::new();
            descriptor.cache_offset = 0;
        });
        Some(frame)
    }

    /// Chain `this` in front of `source`: lookups missing here continue in
    /// `source`. Only a cache without a source may gain one.
    pub fn set_source(this: &Arc<Cache>, source: &Arc<Cache>) {
        debug_assert!(!Self::reachable_from(source, this), "source cycle");
        {
            let mut inner = this.inner.lock();
            debug_assert!(inner.source.is_none());
            inner.source = Some(source.clone());
        }
        let mut source_inner = source.inner.lock();
        source_inner.consumers.push(Arc::downgrade(this));
    }

    /// Whether `target` is reachable from `start` along source edges
    fn reachable_from(start: &Arc<Cache>, target: &Arc<Cache>) -> bool {
        let mut current = Some(start.clone());
        while let Some(cache) = current {
            if Arc::ptr_eq(&cache, target) {
                return true;
            }
            current = cache.inner.lock().source.clone();
        }
        false
    }

    /// Register an area as backed by this cache
    pub fn add_area(&self, area: &Arc<Area>) {
        self.inner.lock().areas.push(Arc::downgrade(area));
    }

    /// Drop an area from the backing set; may trigger a merge
    pub fn remove_area(this: &Arc<Cache>, area: &Arc<Area>) {
        {
            let mut inner = this.inner.lock();
            inner
                .areas
                .retain(|weak| weak.upgrade().map_or(false, |a| !Arc::ptr_eq(&a, area)));
        }
        Self::maybe_merge(this);
    }

    /// Snapshot of the live areas backed by this cache
    pub fn areas(&self) -> Vec<Arc<Area>> {
        self.inner
            .lock()
            .areas
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Commit `size` bytes (an absolute end offset) to the store
    pub fn commit(&self, size: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let window = inner.window();
        inner.store.commit(size, window)
    }

    /// Bytes reserved on behalf of the store
    pub fn committed_size(&self) -> u64 {
        self.inner.lock().store.committed_size()
    }

    /// The store's guard range within this cache's window, as
    /// `(start, length)` byte offsets
    pub fn guard_range(&self) -> Option<(u64, u64)> {
        let inner = self.inner.lock();
        let window = inner.window();
        inner.store.guard_range(window)
    }

    /// Change the window size. Pages beyond a shrunk window are freed; the
    /// caller must have removed their mappings first.
    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let old_size = inner.virtual_size;
        inner.virtual_size = new_size;

        if new_size < old_size {
            let virtual_base = inner.virtual_base;
            let first_gone = (virtual_base + new_size) / PAGE_SIZE;
            let gone: Vec<u64> = inner
                .pages
                .range(first_gone..)
                .map(|(_, &frame)| frame)
                .collect();
            inner.pages.retain(|&index, _| index < first_gone);
            for frame in gone {
                self.page_manager.with_descriptor(frame, |descriptor| {
                    descriptor.cache = Weak::new();
                });
                self.page_manager.free(frame);
            }

            // Release surplus commitment past the new window end.
            let window = inner.window();
            if inner.store.committed_size() > new_size {
                inner.store.commit(virtual_base + new_size, window)?;
            }
        }

        Ok(())
    }

    /// Merge this cache into its only consumer if it has become a pure
    /// pass-through: temporary, area-less, exactly one consumer.
    ///
    /// Pages the consumer does not own at the same offset are hoisted into
    /// it; shadowed pages are freed. The consumer inherits this cache's
    /// source, so areas keep seeing the same bytes at every offset.
    pub fn maybe_merge(this: &Arc<Cache>) {
        let consumer = {
            let mut inner = this.inner.lock();
            if !inner.temporary || inner.busy {
                return;
            }
            inner.areas.retain(|weak| weak.upgrade().is_some());
            if !inner.areas.is_empty() {
                return;
            }
            inner.consumers.retain(|weak| weak.upgrade().is_some());
            if inner.consumers.len() != 1 {
                return;
            }
            let Some(consumer) = inner.consumers[0].upgrade() else {
                return;
            };
            inner.busy = true;
            consumer
        };

        log::debug!(
            "merging cache {} into its only consumer {}",
            this.id,
            consumer.id
        );
        Self::merge_into(this, &consumer);
    }

    fn merge_into(this: &Arc<Cache>, consumer: &Arc<Cache>) {
        // Consumer sits above this cache in the chain: lock top-down.
        let mut consumer_inner = consumer.inner.lock();
        let mut inner = this.inner.lock();

        let pages = core::mem::take(&mut inner.pages);
        for (index, frame) in pages {
            let offset = index * PAGE_SIZE;
            let wanted = offset >= consumer_inner.virtual_base
                && offset < consumer_inner.virtual_base + consumer_inner.virtual_size
                && !consumer_inner.pages.contains_key(&index);
            if wanted {
                consumer_inner.pages.insert(index, frame);
                this.page_manager.with_descriptor(frame, |descriptor| {
                    descriptor.cache = Arc::downgrade(consumer);
                });
            } else {
                this.page_manager.with_descriptor(frame, |descriptor| {
                    descriptor.cache = Weak::new();
                });
                this.page_manager.free(frame);
            }
        }

        // The consumer inherits this cache's source.
        let grandparent = inner.source.take();
        if let Some(ref grandparent) = grandparent {
            let this_weak = Arc::downgrade(this);
            let mut grandparent_inner = grandparent.inner.lock();
            grandparent_inner
                .consumers
                .retain(|weak| !weak.ptr_eq(&this_weak));
            grandparent_inner.consumers.push(Arc::downgrade(consumer));
        }

        debug_assert!(consumer_inner
            .source
            .as_ref()
            .map_or(false, |source| Arc::ptr_eq(source, this)));
        consumer_inner.source = grandparent;
        inner.consumers.clear();
        inner.busy = false;
    }

    /// Run `f` with mutable access to the store
    pub fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut self.inner.lock().store)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        for (_, frame) in core::mem::take(&mut inner.pages) {
            self.page_manager.with_descriptor(frame, |descriptor| {
                descriptor.cache = Weak::new();
            });
            self.page_manager.free(frame);
        }

        // Detach from the source; that may leave it with a single consumer.
        if let Some(source) = inner.source.take() {
            {
                let mut source_inner = source.inner.lock();
                source_inner
                    .consumers
                    .retain(|weak| weak.upgrade().is_some());
            }
            Cache::maybe_merge(&source);
        }
        // The store is dropped with the cache, releasing its commitment.
    }
}
