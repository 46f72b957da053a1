//! Argument and result descriptors exchanged across the driver-interface boundary.

use crate::kmt::handle::KmtHandle;
use serde::{Deserialize, Serialize};

// ===============================================================================================
// Adapter
// ===============================================================================================

/// Locally unique adapter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Luid {
    pub low_part: u32,
    pub high_part: i32,
}

impl Luid {
    #[must_use]
    pub const fn new(low_part: u32, high_part: i32) -> Self {
        Self {
            low_part,
            high_part,
        }
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.low_part == 0 && self.high_part == 0
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

#[derive(Debug, Clone, Default)]
pub struct CreateContextArgs {
    pub device: KmtHandle,
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    /// Opaque initialization blob. Its presence must agree with `private_driver_data_size`.
    pub private_driver_data: Option<Vec<u8>>,
    pub private_driver_data_size: u32,
}

// ===============================================================================================
// Allocation & Resource
// ===============================================================================================

#[derive(Debug, Clone, Default)]
pub struct AllocationInfo {
    pub size: u64,
    pub private_driver_data: Vec<u8>,
}

impl AllocationInfo {
    #[must_use]
    pub const fn with_size(size: u64) -> Self {
        Self {
            size,
            private_driver_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateAllocationFlags {
    pub create_resource: bool,
    pub create_shared: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateAllocationArgs {
    pub device: KmtHandle,
    pub allocation_info: Vec<AllocationInfo>,
    pub flags: CreateAllocationFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateAllocationOutput {
    pub resource: Option<KmtHandle>,
    pub global_share: Option<KmtHandle>,
    pub allocations: Vec<KmtHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyAllocationArgs {
    pub device: KmtHandle,
    pub allocations: Vec<KmtHandle>,
    /// Destroys the resource and every allocation it still owns. `NULL` when unused.
    pub resource: KmtHandle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub num_allocations: u32,
    pub private_runtime_data_size: u32,
    pub total_private_driver_data_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenResourceOutput {
    pub resource: KmtHandle,
    pub allocations: Vec<KmtHandle>,
}

// ===============================================================================================
// Virtual Address & Residency
// ===============================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MapGpuVaArgs {
    pub paging_queue: KmtHandle,
    pub allocation: KmtHandle,
    /// Requested VA, or `0` to let the driver choose.
    pub base_address: u64,
    pub minimum_address: u64,
    pub maximum_address: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MakeResidentArgs {
    pub paging_queue: KmtHandle,
    pub allocations: Vec<KmtHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Work was queued; its result is usable once the paired fence value is observed.
    Pending,
}

/// Result of an operation that completes asynchronously on a paging queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PagingResult<T> {
    pub status: Status,
    pub value: T,
    pub fence_value: u64,
}

impl<T> PagingResult<T> {
    pub(crate) const fn pending(value: T, fence_value: u64) -> Self {
        Self {
            status: Status::Pending,
            value,
            fence_value,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingQueueInfo {
    pub handle: KmtHandle,
    pub sync_object: KmtHandle,
    pub fence_cpu_address: u64,
}

// ===============================================================================================
// Synchronization & Submission
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncObjectInfo {
    pub handle: KmtHandle,
    pub fence_cpu_address: u64,
    pub fence_gpu_address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwQueueInfo {
    pub handle: KmtHandle,
    pub progress_fence: KmtHandle,
    pub progress_fence_cpu_address: u64,
    pub progress_fence_gpu_address: u64,
    pub initial_fence_value: u64,
}

/// Submitted work. Contents are never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandBuffer {
    pub gpu_address: u64,
    pub length: u32,
}
