pub mod aperture;
pub mod manager;

use crate::kmt::handle::KmtHandle;

/// Which heap of the GPU VA partition an allocation was carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Standard,
    Standard64Kb,
    Svm,
    Heap32(usize),
}

/// Represents a successful memory allocation on the GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub handle: KmtHandle,            // Driver allocation handle
    pub resource: Option<KmtHandle>,  // Owning resource, if created as one
    pub gpu_va: u64,                  // GPU Virtual Address
    pub size: u64,                    // Size in bytes
    pub cpu_address: u64,             // Host address while locked, 0 otherwise
    pub heap: HeapKind,
    /// Paging fence value to observe before the GPU may touch the allocation.
    pub paging_fence: u64,
}

impl Allocation {
    #[must_use]
    pub const fn host_ptr(&self) -> *mut u8 {
        self.cpu_address as *mut u8
    }

    #[must_use]
    pub const fn is_host_visible(&self) -> bool {
        self.cpu_address != 0
    }
}

/// Trait for VA range allocation strategies.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Free a previously reserved virtual address range.
    fn free_va(&mut self, addr: u64, size: u64);

    /// Get the aperture's base and inclusive limit.
    fn bounds(&self) -> (u64, u64);

    fn contains(&self, addr: u64) -> bool {
        let (base, limit) = self.bounds();
        addr >= base && addr <= limit
    }
}

pub use manager::{AllocFlags, MemoryManager};
