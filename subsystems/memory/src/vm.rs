//! # The VM Facade
//!
//! One object owns every process-wide piece of the memory subsystem: the
//! page manager, the commit counter, the address-space and area registries,
//! the mapping pool and the daemon pools. The kernel boots it once from the
//! boot args; tests build private instances.

use crate::address_space::{
    AddressSpace, AddressSpaceRegistry, AspaceKind, KERNEL_BASE, KERNEL_SIZE, USER_BASE,
    USER_SIZE,
};
use crate::area::{
    AccessKind, AddressSpec, Area, AreaProtection, AreaWiring, CloneMapping,
};
use crate::cache::{Cache, CacheType};
use crate::commit::CommitAccounting;
use crate::daemon::DaemonPool;
use crate::mapping::MappingPool;
use crate::page::{PageManager, PageState};
use crate::store::{
    AnonymousStore, DeviceStore, NullStore, StackGrowth, Store, Vnode, VnodeStore,
};
use crate::{AreaId, MemoryStats, TeamId, VmError, VmResult, KERNEL_TEAM, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use hashbrown::HashMap;
use spin::{Once, RwLock};
use vireo_hal::arch_stubs::SoftTranslationMap;
use vireo_hal::mmu::MapProtection;
use vireo_hal::{is_page_aligned, PhysAddr, VirtAddr};

/// The page scanner runs every this many daemon ticks
pub const PAGE_SCANNER_FREQUENCY: i32 = 10;

/// Boot-time configuration handed over by the bootloader
#[derive(Debug, Clone, Copy)]
pub struct BootArgs {
    /// Number of physical pages to manage
    pub total_pages: u64,
    /// Commit ceiling in bytes; defaults to all of physical memory
    pub commit_limit: Option<u64>,
    /// Conservative boot: skip background maintenance
    pub safemode: bool,
    /// Leave power management alone
    pub disable_apm: bool,
}

impl Default for BootArgs {
    fn default() -> Self {
        Self {
            total_pages: 1024,
            commit_limit: None,
            safemode: false,
            disable_apm: false,
        }
    }
}

/// Extra knobs for anonymous areas
#[derive(Debug, Clone, Copy)]
pub struct AnonymousOptions {
    /// Pages reserved up front for an overcommitting store
    pub precommit_pages: u32,
    /// Pages at the growth end that always fault
    pub guard_pages: u32,
    /// Which way the guard end faces
    pub growth: StackGrowth,
}

impl Default for AnonymousOptions {
    fn default() -> Self {
        Self {
            precommit_pages: 0,
            guard_pages: 0,
            growth: StackGrowth::Downward,
        }
    }
}

/// The virtual memory subsystem
pub struct Vm {
    pub(crate) page_manager: Arc<PageManager>,
    pub(crate) commitment: Arc<CommitAccounting>,
    pub(crate) address_spaces: AddressSpaceRegistry,
    pub(crate) areas: RwLock<HashMap<AreaId, Arc<Area>>>,
    pub(crate) mappings: MappingPool,
    pub(crate) kernel_daemons: DaemonPool,
    pub(crate) resource_resizers: DaemonPool,
    pub(crate) low_page_threshold: u64,
    next_area_id: AtomicI32,
    safemode: bool,
}

impl Vm {
    /// Boot the subsystem from `args`: page arena, commit counter, kernel
    /// address space and the two daemon pools
    pub fn new(args: BootArgs) -> Self {
        let commit_limit = args
            .commit_limit
            .unwrap_or(args.total_pages * PAGE_SIZE);
        let page_manager = Arc::new(PageManager::new(args.total_pages));
        let commitment = Arc::new(CommitAccounting::new(commit_limit));

        let address_spaces = AddressSpaceRegistry::new();
        let kernel_space = AddressSpace::new(
            KERNEL_TEAM,
            AspaceKind::Kernel,
            VirtAddr::new(KERNEL_BASE),
            KERNEL_SIZE,
            Box::new(SoftTranslationMap::new()),
        );
        address_spaces.insert(kernel_space);
        address_spaces.set_current_team(KERNEL_TEAM);

        log::info!(
            "vm: {} pages, commit limit {} bytes{}{}",
            args.total_pages,
            commit_limit,
            if args.safemode { ", safemode" } else { "" },
            if args.disable_apm { ", apm disabled" } else { "" },
        );

        Self {
            page_manager,
            commitment,
            address_spaces,
            areas: RwLock::new(HashMap::new()),
            mappings: MappingPool::new(),
            kernel_daemons: DaemonPool::new("kernel daemon"),
            resource_resizers: DaemonPool::new("resource resizer"),
            low_page_threshold: (args.total_pages / 16).max(4),
            next_area_id: AtomicI32::new(1),
            safemode: args.safemode,
        }
    }

    /// The page manager
    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }

    /// The system commit counter
    pub fn commitment(&self) -> &Arc<CommitAccounting> {
        &self.commitment
    }

    /// The address-space registry
    pub fn address_spaces(&self) -> &AddressSpaceRegistry {
        &self.address_spaces
    }

    /// The general-purpose daemon pool
    pub fn kernel_daemons(&self) -> &DaemonPool {
        &self.kernel_daemons
    }

    /// The resource-resizer daemon pool
    pub fn resource_resizers(&self) -> &DaemonPool {
        &self.resource_resizers
    }

    /// Whether the kernel booted in safemode
    pub fn safemode(&self) -> bool {
        self.safemode
    }

    /// Look up a live area by id
    pub fn area_by_id(&self, id: AreaId) -> Option<Arc<Area>> {
        self.areas.read().get(&id).cloned()
    }

    /// Number of live areas
    pub fn area_count(&self) -> usize {
        self.areas.read().len()
    }

    // ---- address-space lifecycle ------------------------------------------

    /// Create and register a user address space for `team`
    pub fn create_address_space(&self, team: TeamId) -> VmResult<Arc<AddressSpace>> {
        if team == KERNEL_TEAM || self.address_spaces.get(team).is_some() {
            return Err(VmError::BadValue);
        }
        let space = AddressSpace::new(
            team,
            AspaceKind::User,
            VirtAddr::new(USER_BASE),
            USER_SIZE,
            Box::new(SoftTranslationMap::new()),
        );
        self.address_spaces.insert(space.clone());
        log::debug!("created address space for team {team}");
        Ok(space)
    }

    /// Tear down a team's address space: mark it deleting, delete every
    /// area, drop it from the registry
    pub fn delete_address_space(&self, team: TeamId) -> VmResult<()> {
        if team == KERNEL_TEAM {
            return Err(VmError::BadValue);
        }
        let space = self.address_spaces.get(team).ok_or(VmError::BadTeam)?;
        space.mark_deleting();

        for area in space.areas() {
            self.areas.write().remove(&area.id());
            self.tear_down_area(&space, &area);
        }

        self.address_spaces.remove(team);
        log::debug!("deleted address space of team {team}");
        Ok(())
    }

    // ---- area management --------------------------------------------------

    /// Create an anonymous area; stack-marked areas get overcommit and a
    /// one-page guard by default
    pub fn create_area(
        &self,
        aspace: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        size: u64,
        wiring: AreaWiring,
        protection: AreaProtection,
    ) -> VmResult<AreaId> {
        let mut options = AnonymousOptions::default();
        if protection.is_stack() {
            options.guard_pages = 1;
        }
        self.create_anonymous_area(aspace, name, spec, size, wiring, protection, options)
    }

    /// Create an anonymous area with explicit store options
    #[allow(clippy::too_many_arguments)]
    pub fn create_anonymous_area(
        &self,
        aspace: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        size: u64,
        wiring: AreaWiring,
        protection: AreaProtection,
        options: AnonymousOptions,
    ) -> VmResult<AreaId> {
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::BadValue);
        }

        // Wired pages take real memory immediately, so overcommit cannot
        // apply to them.
        let wire_now = matches!(wiring, AreaWiring::Full | AreaWiring::Contiguous);
        let can_overcommit = !wire_now
            && (protection.contains(AreaProtection::OVERCOMMIT) || protection.is_stack());
        let store = Store::Anonymous(AnonymousStore::new(
            self.commitment.clone(),
            can_overcommit,
            options.precommit_pages,
            options.guard_pages,
            options.growth,
        ));
        let cache = Cache::new(
            self.page_manager.clone(),
            store,
            CacheType::Ram,
            0,
            size,
            true,
        );

        // Fully wired areas take their whole commitment up front.
        if wire_now {
            cache.commit(size)?;
        }

        let id = self.next_area_id();
        let area = aspace.create_area_in(spec, size, |base| {
            Area::new(
                id,
                name,
                base,
                size,
                protection,
                wiring,
                cache.clone(),
                0,
                aspace,
            )
        })?;
        cache.add_area(&area);
        self.areas.write().insert(id, area.clone());

        if wire_now {
            if let Err(error) = self.wire_area_pages(aspace, &area, &cache, wiring) {
                self.areas.write().remove(&id);
                self.tear_down_area(aspace, &area);
                return Err(error);
            }
        }

        log::debug!(
            "created area {id} \"{name}\" at {:#x}, {size:#x} bytes",
            area.base().as_u64()
        );
        Ok(id)
    }

    fn wire_area_pages(
        &self,
        aspace: &Arc<AddressSpace>,
        area: &Arc<Area>,
        cache: &Arc<Cache>,
        wiring: AreaWiring,
    ) -> VmResult<()> {
        let size = area.size();

        // The store's guard window stays unmapped; a touch there must still
        // fault through the store as a stack overflow.
        let guard = cache.guard_range();
        let mut offsets = Vec::new();
        for index in 0..size / PAGE_SIZE {
            let offset = index * PAGE_SIZE;
            let guarded =
                guard.map_or(false, |(start, length)| offset >= start && offset < start + length);
            if !guarded {
                offsets.push(offset);
            }
        }
        if offsets.is_empty() {
            return Ok(());
        }

        let frames: Vec<u64> = if wiring == AreaWiring::Contiguous {
            self.page_manager.allocate_contiguous(offsets.len(), true)?
        } else {
            let mut frames = Vec::with_capacity(offsets.len());
            for _ in 0..offsets.len() {
                match self.page_manager.allocate(true) {
                    Ok(frame) => frames.push(frame),
                    Err(error) => {
                        for &frame in &frames {
                            self.page_manager.free(frame);
                        }
                        return Err(error);
                    }
                }
            }
            frames
        };

        let protection = area.protection();
        let map_protection = protection.to_map_protection(protection.is_writable());
        for (position, (&offset, &frame)) in offsets.iter().zip(frames.iter()).enumerate() {
            Cache::insert_page(cache, offset, frame);
            let address = area.base().add(offset);
            if aspace
                .translation_map()
                .map(address, PhysAddr::from_frame(frame), map_protection)
                .is_err()
            {
                // Frames not yet in the cache would otherwise leak; the
                // inserted ones go back with the area teardown.
                for &rest in &frames[position + 1..] {
                    self.page_manager.free(rest);
                }
                return Err(VmError::OutOfMemory);
            }
            self.record_mapping(area, frame, address);
            self.page_manager.wire(frame);
        }
        aspace.translation_map().flush();
        Ok(())
    }

    /// Delete an area: mappings, translations, space and cache membership
    pub fn delete_area(&self, id: AreaId) -> VmResult<()> {
        let area = self.areas.write().remove(&id).ok_or(VmError::BadArea)?;
        let aspace = area.address_space().ok_or(VmError::BadTeam)?;
        self.tear_down_area(&aspace, &area);
        log::debug!("deleted area {id}");
        Ok(())
    }

    fn tear_down_area(&self, aspace: &Arc<AddressSpace>, area: &Arc<Area>) {
        let wired = area.wiring().is_wired();

        let ids = {
            let mut inner = area.lock();
            core::mem::take(&mut inner.mappings)
        };
        for id in ids {
            let Some(record) = self.mappings.remove(id) else {
                continue;
            };
            self.page_manager.with_descriptor(record.frame, |descriptor| {
                descriptor.mappings.retain(|&m| m != id);
            });
            if wired {
                self.page_manager.unwire(record.frame);
            }
        }

        let _ = aspace.translation_map().unmap(area.base(), area.size());
        aspace.translation_map().flush();

        aspace.remove_area(area.base());
        let cache = area.cache();
        Cache::remove_area(&cache, area);
    }

    /// Resize an area in place. Refused while wired; shrinking unmaps and
    /// frees the truncated range.
    pub fn resize_area(&self, id: AreaId, new_size: u64) -> VmResult<()> {
        if new_size == 0 || !is_page_aligned(new_size) {
            return Err(VmError::BadValue);
        }
        let area = self.area_by_id(id).ok_or(VmError::BadArea)?;
        if area.wiring().is_wired() {
            return Err(VmError::BadValue);
        }
        let aspace = area.address_space().ok_or(VmError::BadTeam)?;
        let old_size = area.size();
        if new_size == old_size {
            return Ok(());
        }
        let cache = area.cache();
        let sole_owner = cache.areas().len() == 1;

        if new_size > old_size {
            if !aspace.can_grow_area(area.base(), new_size) {
                return Err(VmError::OutOfMemory);
            }
            if sole_owner {
                cache.resize(new_size)?;
            }
            area.lock().size = new_size;
        } else {
            // Retire mappings in the range being cut off.
            let cutoff = area.base().add(new_size);
            let ids = area.mappings();
            for mapping_id in ids {
                let Some(record) = self.mappings.get(mapping_id) else {
                    continue;
                };
                if record.address < cutoff {
                    continue;
                }
                self.mappings.remove(mapping_id);
                area.lock().mappings.retain(|&m| m != mapping_id);
                self.page_manager.with_descriptor(record.frame, |descriptor| {
                    descriptor.mappings.retain(|&m| m != mapping_id);
                });
            }
            let _ = aspace
                .translation_map()
                .unmap(cutoff, old_size - new_size);
            aspace.translation_map().flush();

            area.lock().size = new_size;
            if sole_owner {
                cache.resize(new_size)?;
            }
        }

        aspace.resize_area_accounting(old_size, new_size);
        Ok(())
    }

    /// Change an area's protection. Installed translations are downgraded
    /// where the change removes permissions; they are never upgraded in
    /// place, so copy-on-write and modified tracking stay intact.
    pub fn set_area_protection(&self, id: AreaId, protection: AreaProtection) -> VmResult<()> {
        let area = self.area_by_id(id).ok_or(VmError::BadArea)?;
        let aspace = area.address_space().ok_or(VmError::BadTeam)?;

        area.lock().protection = protection;

        let map = aspace.translation_map();
        let allowed = protection.to_map_protection(true);
        let pages = area.size() / PAGE_SIZE;
        for index in 0..pages {
            let address = area.base().add(index * PAGE_SIZE);
            if let Some((phys, installed)) = map.query(address) {
                let _ = map.map(address, phys, installed & allowed);
            }
        }
        map.flush();
        Ok(())
    }

    /// Clone an area into `target`. A `Private` mapping chains a fresh
    /// cache in front of the source's, giving both sides copy-on-write; a
    /// `Shared` mapping reuses the source cache outright.
    #[allow(clippy::too_many_arguments)]
    pub fn clone_area(
        &self,
        target: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        protection: AreaProtection,
        mapping: CloneMapping,
        source_id: AreaId,
    ) -> VmResult<AreaId> {
        let source_area = self.area_by_id(source_id).ok_or(VmError::BadArea)?;
        let source_space = source_area.address_space().ok_or(VmError::BadArea)?;
        let size = source_area.size();
        let (source_cache, source_offset) = {
            let inner = source_area.lock();
            (inner.cache.clone(), inner.cache_offset)
        };

        let cache = match mapping {
            CloneMapping::Shared => source_cache,
            CloneMapping::Private => {
                let store = Store::Anonymous(AnonymousStore::new(
                    self.commitment.clone(),
                    false,
                    0,
                    0,
                    StackGrowth::Downward,
                ));
                let child = Cache::new(
                    self.page_manager.clone(),
                    store,
                    CacheType::Ram,
                    source_offset,
                    size,
                    true,
                );
                Cache::set_source(&child, &source_cache);

                // The source side becomes copy-on-write as well, or its
                // writes would leak into the clone.
                if source_area.protection().is_writable() {
                    self.push_cow_cache(&source_space, &source_area, &source_cache);
                }
                child
            }
        };

        let id = self.next_area_id();
        let area = target.create_area_in(spec, size, |base| {
            Area::new(
                id,
                name,
                base,
                size,
                protection,
                AreaWiring::NoLock,
                cache.clone(),
                source_offset,
                target,
            )
        })?;
        cache.add_area(&area);
        self.areas.write().insert(id, area.clone());

        log::debug!("cloned area {source_id} into {id} ({mapping:?})");
        Ok(id)
    }

    /// Put an empty cache in front of `area`'s current one and retarget the
    /// area at it, write-protecting whatever is currently installed
    fn push_cow_cache(
        &self,
        aspace: &Arc<AddressSpace>,
        area: &Arc<Area>,
        old_cache: &Arc<Cache>,
    ) {
        let (cache_offset, size) = {
            let inner = area.lock();
            (inner.cache_offset, inner.size)
        };
        let store = Store::Anonymous(AnonymousStore::new(
            self.commitment.clone(),
            false,
            0,
            0,
            StackGrowth::Downward,
        ));
        let fresh = Cache::new(
            self.page_manager.clone(),
            store,
            CacheType::Ram,
            cache_offset,
            size,
            true,
        );
        Cache::set_source(&fresh, old_cache);

        Cache::remove_area(old_cache, area);
        area.lock().cache = fresh.clone();
        fresh.add_area(area);

        // Writes must fault from now on so they copy up instead of landing
        // in the now-shared pages.
        let map = aspace.translation_map();
        let write_bits = MapProtection::USER_WRITE | MapProtection::KERNEL_WRITE;
        for id in area.mappings() {
            let Some(record) = self.mappings.get(id) else {
                continue;
            };
            if let Some((phys, installed)) = map.query(record.address) {
                let _ = map.map(record.address, phys, installed - write_bits);
            }
        }
        map.flush();
    }

    /// Map a window of physical address space into the kernel
    pub fn map_physical_memory(
        &self,
        name: &str,
        physical: PhysAddr,
        size: u64,
        protection: AreaProtection,
    ) -> VmResult<AreaId> {
        if size == 0 || !is_page_aligned(size) || !physical.is_aligned(PAGE_SIZE) {
            return Err(VmError::BadValue);
        }
        let aspace = self.address_spaces.get_kernel();

        let store = Store::Device(DeviceStore::new(physical));
        let cache = Cache::new(
            self.page_manager.clone(),
            store,
            CacheType::Device,
            0,
            size,
            false,
        );

        let id = self.next_area_id();
        let area = aspace.create_area_in(AddressSpec::Any, size, |base| {
            Area::new(
                id,
                name,
                base,
                size,
                protection,
                AreaWiring::Full,
                cache.clone(),
                0,
                &aspace,
            )
        })?;
        cache.add_area(&area);
        self.areas.write().insert(id, area.clone());

        // Device windows are installed eagerly; there is nothing to demand-
        // page.
        let map_protection = protection.to_map_protection(protection.is_writable());
        let map = aspace.translation_map();
        for index in 0..size / PAGE_SIZE {
            let offset = index * PAGE_SIZE;
            map.map(
                area.base().add(offset),
                physical.add(offset),
                map_protection,
            )
            .map_err(|_| VmError::OutOfMemory)?;
        }
        map.flush();

        log::debug!(
            "mapped physical {:#x} as area {id} at {:#x}",
            physical.as_u64(),
            area.base().as_u64()
        );
        Ok(id)
    }

    /// Reserve a range of address space: a null-backed area whose faults
    /// always fail
    pub fn reserve_address_range(
        &self,
        aspace: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        size: u64,
    ) -> VmResult<AreaId> {
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::BadValue);
        }
        let cache = Cache::new(
            self.page_manager.clone(),
            Store::Null(NullStore::new()),
            CacheType::Null,
            0,
            size,
            false,
        );
        let id = self.next_area_id();
        let area = aspace.create_area_in(spec, size, |base| {
            Area::new(
                id,
                name,
                base,
                size,
                AreaProtection::READ | AreaProtection::KERNEL_READ,
                AreaWiring::NoLock,
                cache.clone(),
                0,
                aspace,
            )
        })?;
        cache.add_area(&area);
        self.areas.write().insert(id, area.clone());
        Ok(id)
    }

    /// Create an area backed by a file-like object
    #[allow(clippy::too_many_arguments)]
    pub fn create_vnode_area(
        &self,
        aspace: &Arc<AddressSpace>,
        name: &str,
        spec: AddressSpec,
        size: u64,
        protection: AreaProtection,
        vnode: Arc<dyn Vnode>,
    ) -> VmResult<AreaId> {
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::BadValue);
        }
        let cache = Cache::new(
            self.page_manager.clone(),
            Store::Vnode(VnodeStore::new(vnode)),
            CacheType::Vnode,
            0,
            size,
            false,
        );
        let id = self.next_area_id();
        let area = aspace.create_area_in(spec, size, |base| {
            Area::new(
                id,
                name,
                base,
                size,
                protection,
                AreaWiring::NoLock,
                cache.clone(),
                0,
                aspace,
            )
        })?;
        cache.add_area(&area);
        self.areas.write().insert(id, area.clone());
        Ok(id)
    }

    // ---- memory access ----------------------------------------------------

    /// Read through an address space, faulting pages in as needed
    pub fn read_memory(
        &self,
        aspace: &Arc<AddressSpace>,
        address: VirtAddr,
        buf: &mut [u8],
    ) -> VmResult<()> {
        let user = aspace.kind() == AspaceKind::User;
        let mut done = 0usize;
        while done < buf.len() {
            let current = address.add(done as u64);
            let in_page = (PAGE_SIZE - current.page_offset()) as usize;
            let chunk = in_page.min(buf.len() - done);

            let phys = match aspace.translation_map().query(current) {
                Some((phys, _)) => phys,
                None => {
                    self.page_fault(aspace, current, AccessKind::Read, user)?;
                    aspace
                        .translation_map()
                        .query(current)
                        .ok_or(VmError::BadAddress)?
                        .0
                }
            };
            let frame = phys.frame_number();
            if frame >= self.page_manager.total_pages() {
                return Err(VmError::BadAddress);
            }
            self.page_manager.read_bytes(
                frame,
                current.page_offset(),
                &mut buf[done..done + chunk],
            );
            done += chunk;
        }
        Ok(())
    }

    /// Write through an address space, faulting pages in (and copying them
    /// up) as needed
    pub fn write_memory(
        &self,
        aspace: &Arc<AddressSpace>,
        address: VirtAddr,
        buf: &[u8],
    ) -> VmResult<()> {
        let user = aspace.kind() == AspaceKind::User;
        let mut done = 0usize;
        while done < buf.len() {
            let current = address.add(done as u64);
            let in_page = (PAGE_SIZE - current.page_offset()) as usize;
            let chunk = in_page.min(buf.len() - done);

            let phys = match aspace.translation_map().query(current) {
                Some((phys, protection)) if protection.allows_write(user) => phys,
                _ => {
                    self.page_fault(aspace, current, AccessKind::Write, user)?;
                    aspace
                        .translation_map()
                        .query(current)
                        .ok_or(VmError::BadAddress)?
                        .0
                }
            };
            let frame = phys.frame_number();
            if frame >= self.page_manager.total_pages() {
                return Err(VmError::BadAddress);
            }
            self.page_manager
                .write_bytes(frame, current.page_offset(), &buf[done..done + chunk]);
            self.page_manager.mark_modified(frame);
            done += chunk;
        }
        Ok(())
    }

    // ---- daemons -----------------------------------------------------------

    /// Register a hook on the kernel-daemon pool
    pub fn register_kernel_daemon(
        &self,
        hook: crate::daemon::DaemonHook,
        arg: usize,
        frequency: i32,
    ) -> VmResult<()> {
        self.kernel_daemons.register(hook, arg, frequency)
    }

    /// Remove a hook from the kernel-daemon pool
    pub fn unregister_kernel_daemon(
        &self,
        hook: crate::daemon::DaemonHook,
        arg: usize,
    ) -> VmResult<()> {
        self.kernel_daemons.unregister(hook, arg)
    }

    /// Register a hook on the resource-resizer pool
    pub fn register_resource_resizer(
        &self,
        hook: crate::daemon::DaemonHook,
        arg: usize,
        frequency: i32,
    ) -> VmResult<()> {
        self.resource_resizers.register(hook, arg, frequency)
    }

    /// Remove a hook from the resource-resizer pool
    pub fn unregister_resource_resizer(
        &self,
        hook: crate::daemon::DaemonHook,
        arg: usize,
    ) -> VmResult<()> {
        self.resource_resizers.unregister(hook, arg)
    }

    // ---- statistics --------------------------------------------------------

    /// Snapshot of the subsystem's counters
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_pages: self.page_manager.total_pages(),
            free_pages: self.page_manager.queue_len(PageState::Free) as u64,
            clear_pages: self.page_manager.queue_len(PageState::Clear) as u64,
            active_pages: self.page_manager.queue_len(PageState::Active) as u64,
            inactive_pages: self.page_manager.queue_len(PageState::Inactive) as u64,
            modified_pages: self.page_manager.queue_len(PageState::Modified) as u64,
            wired_pages: self.page_manager.queue_len(PageState::Wired) as u64,
            committed_bytes: self.commitment.used(),
            commit_limit: self.commitment.limit(),
            address_spaces: self.address_spaces.len() as u64,
            areas: self.area_count() as u64,
        }
    }

    fn next_area_id(&self) -> AreaId {
        self.next_area_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for Vm {
    /// Shutdown teardown: areas go first (they pin caches, mappings and
    /// pages), then the registries drop with the facade.
    fn drop(&mut self) {
        let areas: Vec<Arc<Area>> = self.areas.write().drain().map(|(_, area)| area).collect();
        for area in areas {
            match area.address_space() {
                Some(aspace) => self.tear_down_area(&aspace, &area),
                None => {
                    // The space died first; just retire the records so the
                    // pages free cleanly.
                    let ids = {
                        let mut inner = area.lock();
                        core::mem::take(&mut inner.mappings)
                    };
                    for id in ids {
                        if let Some(record) = self.mappings.remove(id) {
                            self.page_manager.with_descriptor(record.frame, |descriptor| {
                                descriptor.mappings.retain(|&m| m != id);
                            });
                        }
                    }
                }
            }
        }
    }
}

// ---- the boot singleton ----------------------------------------------------

static VM: Once<Vm> = Once::new();

/// Boot the global VM. Idempotent; the first caller's args win.
pub fn init(args: BootArgs) -> &'static Vm {
    VM.call_once(|| {
        let vm = Vm::new(args);
        if !vm.safemode {
            // The scanner shares the kernel-daemon thread with everyone
            // else registered there.
            let _ = vm
                .kernel_daemons
                .register(page_scanner_daemon, 0, PAGE_SCANNER_FREQUENCY);
        }
        vm
    })
}

/// The global VM; [`init`] must have run
pub fn vm() -> &'static Vm {
    VM.get().expect("virtual memory not initialized")
}

/// The global VM, if it has been booted
pub fn try_vm() -> Option<&'static Vm> {
    VM.get()
}

fn page_scanner_daemon(_arg: usize, _iteration: i64) {
    if let Some(vm) = VM.get() {
        vm.page_daemon_pass();
    }
}

/// Register a hook on the global kernel-daemon pool
pub fn register_kernel_daemon(
    hook: crate::daemon::DaemonHook,
    arg: usize,
    frequency: i32,
) -> VmResult<()> {
    vm().register_kernel_daemon(hook, arg, frequency)
}

/// Remove a hook from the global kernel-daemon pool
pub fn unregister_kernel_daemon(hook: crate::daemon::DaemonHook, arg: usize) -> VmResult<()> {
    vm().unregister_kernel_daemon(hook, arg)
}

/// Register a hook on the global resource-resizer pool
pub fn register_resource_resizer(
    hook: crate::daemon::DaemonHook,
    arg: usize,
    frequency: i32,
) -> VmResult<()> {
    vm().register_resource_resizer(hook, arg, frequency)
}

/// Remove a hook from the global resource-resizer pool
pub fn unregister_resource_resizer(hook: crate::daemon::DaemonHook, arg: usize) -> VmResult<()> {
    vm().unregister_resource_resizer(hook, arg)
}

/// Create an anonymous area in the current team's address space
pub fn create_area(
    name: &str,
    spec: AddressSpec,
    size: u64,
    wiring: AreaWiring,
    protection: AreaProtection,
) -> VmResult<AreaId> {
    let vm = vm();
    let aspace = vm.address_spaces.get_current().ok_or(VmError::BadTeam)?;
    vm.create_area(&aspace, name, spec, size, wiring, protection)
}

/// Delete an area by id, wherever it lives
pub fn delete_area(id: AreaId) -> VmResult<()> {
    vm().delete_area(id)
}

/// Resize an area by id
pub fn resize_area(id: AreaId, new_size: u64) -> VmResult<()> {
    vm().resize_area(id, new_size)
}

/// Change an area's protection by id
pub fn set_area_protection(id: AreaId, protection: AreaProtection) -> VmResult<()> {
    vm().set_area_protection(id, protection)
}

/// Clone an area into the current team's address space
pub fn clone_area(
    name: &str,
    spec: AddressSpec,
    protection: AreaProtection,
    mapping: CloneMapping,
    source_id: AreaId,
) -> VmResult<AreaId> {
    let vm = vm();
    let aspace = vm.address_spaces.get_current().ok_or(VmError::BadTeam)?;
    vm.clone_area(&aspace, name, spec, protection, mapping, source_id)
}

/// Map a physical window into the kernel address space
pub fn map_physical_memory(
    name: &str,
    physical: PhysAddr,
    size: u64,
    protection: AreaProtection,
) -> VmResult<AreaId> {
    vm().map_physical_memory(name, physical, size, protection)
}

/// Kernel-facing fault entry: resolves the owning address space from the
/// faulting address, and panics on fatal kernel faults.
pub fn vm_page_fault(
    address: VirtAddr,
    faulting_pc: VirtAddr,
    is_write: bool,
    is_user: bool,
) -> VmResult<()> {
    let vm = vm();
    let aspace = if address.as_u64() >= KERNEL_BASE {
        vm.address_spaces.get_kernel()
    } else {
        vm.address_spaces.get_current().ok_or(VmError::BadTeam)?
    };

    let kind = if is_write {
        AccessKind::Write
    } else {
        AccessKind::Read
    };
    let result = vm.page_fault(&aspace, address, kind, is_user);

    match result {
        Err(error @ (VmError::BadAddress | VmError::ProtectionViolation)) if !is_user => {
            panic!(
                "kernel page fault: {error:?} at {:#x}, pc {:#x}",
                address.as_u64(),
                faulting_pc.as_u64()
            );
        }
        Err(error @ (VmError::BadAddress | VmError::ProtectionViolation)) => {
            // Delivered to the faulting thread as a signal by the caller.
            log::debug!(
                "user fault: {error:?} at {:#x}, pc {:#x}",
                address.as_u64(),
                faulting_pc.as_u64()
            );
            Err(error)
        }
        other => other,
    }
}
