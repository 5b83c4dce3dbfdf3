//! # Vireo Memory Subsystem
//!
//! The memory subsystem implements the kernel's virtual memory core:
//!
//! - Address spaces and their registry
//! - Areas (named, protected regions of an address space)
//! - Caches and chained copy-on-write
//! - Physical page management and the page scanner
//! - Backing stores (anonymous, vnode, device, null)
//! - The page-fault resolver
//! - The kernel daemon infrastructure
//!
//! ## Key Principle
//!
//! Everything hardware-specific is behind the HAL's translation-map
//! contract. The subsystem itself is architecture-independent and can run
//! hosted on the software translation map for testing.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address_space;
pub mod area;
pub mod cache;
pub mod commit;
pub mod daemon;
pub mod fault;
pub mod mapping;
pub mod page;
pub mod store;
pub mod vm;

#[cfg(test)]
mod tests;

pub use vireo_hal::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Memory subsystem result type
pub type VmResult<T> = Result<T, VmError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No area covers the address, or the address is in a guard range
    BadAddress,
    /// An area exists but forbids the access kind
    ProtectionViolation,
    /// No page is available and reservation failed
    OutOfMemory,
    /// A store's read or write failed
    Io,
    /// A blocking wait was cancelled
    Interrupted,
    /// No address space with that team id
    BadTeam,
    /// No area with that id
    BadArea,
    /// Object not found
    NotFound,
    /// Invalid parameter
    BadValue,
    /// The address space is being torn down
    WouldDelete,
    /// The operation is not allowed in the object's current state
    Busy,
}

/// Team identifier; the owning team of an address space
pub type TeamId = i32;

/// Area identifier
pub type AreaId = i32;

/// Team id of the kernel itself
pub const KERNEL_TEAM: TeamId = 1;

/// Memory statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total physical pages managed
    pub total_pages: u64,
    /// Pages on the free queue
    pub free_pages: u64,
    /// Pages on the clear queue
    pub clear_pages: u64,
    /// Pages on the active queue
    pub active_pages: u64,
    /// Pages on the inactive queue
    pub inactive_pages: u64,
    /// Pages on the modified queue
    pub modified_pages: u64,
    /// Pages on the wired queue
    pub wired_pages: u64,
    /// Bytes reserved at the commit counter
    pub committed_bytes: u64,
    /// Commit ceiling in bytes
    pub commit_limit: u64,
    /// Registered address spaces
    pub address_spaces: u64,
    /// Live areas
    pub areas: u64,
}
