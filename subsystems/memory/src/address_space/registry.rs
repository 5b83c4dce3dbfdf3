//! # Address Space Registry
//!
//! The process-wide table mapping team ids to address spaces, behind a
//! reader/writer lock. Handing out a space clones its `Arc`, which is the
//! reference count the lifecycle protocol runs on.

use super::AddressSpace;
use crate::{TeamId, KERNEL_TEAM};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use hashbrown::HashMap;
use spin::RwLock;

/// The team-id-to-address-space table
pub struct AddressSpaceRegistry {
    spaces: RwLock<HashMap<TeamId, Arc<AddressSpace>>>,
    /// Team whose address space "current" lookups resolve to; maintained by
    /// the scheduler on context switch
    current: AtomicI32,
}

impl AddressSpaceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            current: AtomicI32::new(KERNEL_TEAM),
        }
    }

    /// Register a space under its team id
    pub fn insert(&self, space: Arc<AddressSpace>) {
        let previous = self.spaces.write().insert(space.id(), space);
        debug_assert!(previous.is_none(), "duplicate team id in registry");
    }

    /// Look up by team id, handing out a new reference
    pub fn get(&self, team: TeamId) -> Option<Arc<AddressSpace>> {
        self.spaces.read().get(&team).cloned()
    }

    /// The kernel's address space
    pub fn get_kernel(&self) -> Arc<AddressSpace> {
        self.get(KERNEL_TEAM)
            .expect("kernel address space not initialized")
    }

    /// The current team's address space
    pub fn get_current(&self) -> Option<Arc<AddressSpace>> {
        self.get(self.current.load(Ordering::Relaxed))
    }

    /// Record which team is current; called on context switch
    pub fn set_current_team(&self, team: TeamId) {
        self.current.store(team, Ordering::Relaxed);
    }

    /// Drop a space from the table
    pub fn remove(&self, team: TeamId) -> Option<Arc<AddressSpace>> {
        self.spaces.write().remove(&team)
    }

    /// Number of registered spaces
    pub fn len(&self) -> usize {
        self.spaces.read().len()
    }

    /// Whether no spaces are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered space
    pub fn all(&self) -> Vec<Arc<AddressSpace>> {
        self.spaces.read().values().cloned().collect()
    }
}

impl Default for AddressSpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{AspaceKind, USER_BASE, USER_SIZE};
    use alloc::boxed::Box;
    use vireo_hal::arch_stubs::SoftTranslationMap;
    use vireo_hal::VirtAddr;

    fn space(team: TeamId) -> Arc<AddressSpace> {
        AddressSpace::new(
            team,
            AspaceKind::User,
            VirtAddr::new(USER_BASE),
            USER_SIZE,
            Box::new(SoftTranslationMap::new()),
        )
    }

    #[test]
    fn test_lookup_bumps_reference() {
        let registry = AddressSpaceRegistry::new();
        registry.insert(space(7));

        let held = registry.get(7).unwrap();
        assert_eq!(Arc::strong_count(&held), 2);
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn test_current_team_tracking() {
        let registry = AddressSpaceRegistry::new();
        registry.insert(space(7));
        assert!(registry.get_current().is_none());

        registry.set_current_team(7);
        assert_eq!(registry.get_current().unwrap().id(), 7);
    }

    #[test]
    fn test_remove_forgets_team() {
        let registry = AddressSpaceRegistry::new();
        registry.insert(space(7));
        assert_eq!(registry.len(), 1);
        registry.remove(7);
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }
}
