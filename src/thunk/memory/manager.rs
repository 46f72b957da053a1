use crate::error::{KmtError, KmtResult};
use crate::kmt::adapter::{GfxPartition, HEAP32_COUNT, HeapRange};
use crate::kmt::args::{
    AllocationInfo, CreateAllocationArgs, CreateAllocationFlags, DestroyAllocationArgs,
    MakeResidentArgs, MapGpuVaArgs,
};
use crate::kmt::device::{KmtDriver, warn_on_teardown};
use crate::kmt::handle::{KmtHandle, ObjectKind};
use crate::thunk::memory::aperture::Aperture;
use crate::thunk::memory::{Allocation, ApertureAllocator, HeapKind};
use crate::utils::{MAX_SVM_ADDRESS, PAGE_SIZE_4K, PAGE_SIZE_64K, align_up};
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_ALIGN: u64 = PAGE_SIZE_4K;
const GUARD_PAGES: u64 = 1;

/// Flags controlling memory allocation behavior.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub svm: bool,
    pub heap32: bool,
    pub use_64kb_pages: bool,
    pub create_resource: bool,
    pub create_shared: bool,
    pub host_access: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place the allocation in the range shared with the CPU.
    #[must_use]
    pub const fn svm(mut self) -> Self {
        self.svm = true;
        self
    }

    /// Place the allocation in one of the 4 GiB heaps addressable with 32-bit offsets.
    #[must_use]
    pub const fn heap32(mut self) -> Self {
        self.heap32 = true;
        self
    }

    #[must_use]
    pub const fn use_64kb_pages(mut self) -> Self {
        self.use_64kb_pages = true;
        self
    }

    #[must_use]
    pub const fn resource(mut self) -> Self {
        self.create_resource = true;
        self
    }

    /// Shared allocations are always created as a resource.
    #[must_use]
    pub const fn shared(mut self) -> Self {
        self.create_resource = true;
        self.create_shared = true;
        self
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    const fn to_create_flags(self) -> CreateAllocationFlags {
        CreateAllocationFlags {
            create_resource: self.create_resource,
            create_shared: self.create_shared,
        }
    }
}

/// Per-device GPU VA heaps derived from the adapter's partition.
#[derive(Debug)]
pub struct MemoryManager {
    standard: Aperture,
    standard64kb: Aperture,
    svm: Option<Aperture>,
    heap32: Vec<Aperture>,

    allocations: HashMap<KmtHandle, Allocation>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(partition: &GfxPartition) -> Self {
        // VA 0 means "driver's choice" to the map call, so no heap may hand it out.
        let usable = |range: HeapRange| HeapRange::new(range.base.max(PAGE_SIZE_64K), range.limit);

        let svm = (!partition.svm.is_empty())
            .then(|| Aperture::from_range(usable(partition.svm), DEFAULT_ALIGN, GUARD_PAGES));
        let heap32 = partition
            .heap32
            .iter()
            .map(|&range| Aperture::from_range(usable(range), DEFAULT_ALIGN, 0))
            .collect();

        Self {
            standard: Aperture::from_range(usable(partition.standard), DEFAULT_ALIGN, GUARD_PAGES),
            standard64kb: Aperture::from_range(usable(partition.standard64kb), PAGE_SIZE_64K, GUARD_PAGES),
            svm,
            heap32,
            allocations: HashMap::new(),
        }
    }

    fn aperture_mut(&mut self, heap: HeapKind) -> Option<&mut Aperture> {
        match heap {
            HeapKind::Standard => Some(&mut self.standard),
            HeapKind::Standard64Kb => Some(&mut self.standard64kb),
            HeapKind::Svm => self.svm.as_mut(),
            HeapKind::Heap32(i) => self.heap32.get_mut(i),
        }
    }

    /// Carves a VA range from the heap the flags select.
    fn carve_va(&mut self, size: u64, align: u64, flags: AllocFlags) -> KmtResult<(HeapKind, u64)> {
        if flags.svm {
            let svm = self.svm.as_mut().ok_or_else(|| {
                KmtError::InvalidParameter("adapter has no SVM heap".into())
            })?;
            return svm
                .allocate_va(size, align)
                .map(|va| (HeapKind::Svm, va))
                .ok_or(KmtError::OutOfVirtualAddressSpace);
        }

        if flags.heap32 {
            return (0..HEAP32_COUNT.min(self.heap32.len()))
                .find_map(|i| {
                    self.heap32[i]
                        .allocate_va(size, align)
                        .map(|va| (HeapKind::Heap32(i), va))
                })
                .ok_or(KmtError::OutOfVirtualAddressSpace);
        }

        let heap = if flags.use_64kb_pages {
            HeapKind::Standard64Kb
        } else {
            HeapKind::Standard
        };
        self.aperture_mut(heap)
            .and_then(|aperture| aperture.allocate_va(size, align))
            .map(|va| (heap, va))
            .ok_or(KmtError::OutOfVirtualAddressSpace)
    }

    fn release_va(&mut self, heap: HeapKind, va: u64, size: u64) {
        if let Some(aperture) = self.aperture_mut(heap) {
            aperture.free_va(va, size);
        }
    }

    /// Unified Allocation Function.
    ///
    /// Carves a VA from the selected heap, creates the driver allocation, maps it at that VA,
    /// makes it resident and, for host access, locks it. A failure at any step undoes the
    /// earlier ones.
    ///
    /// # Errors
    /// Whatever the failing step returns; `OutOfVirtualAddressSpace` if no heap has room.
    pub fn allocate(
        &mut self,
        driver: &KmtDriver,
        device: KmtHandle,
        paging_queue: KmtHandle,
        size: u64,
        align: u64,
        flags: AllocFlags,
    ) -> KmtResult<Allocation> {
        let page = if flags.use_64kb_pages {
            PAGE_SIZE_64K
        } else {
            PAGE_SIZE_4K
        };
        let size = align_up(size.max(1), page);

        // 1. Select heap and allocate Virtual Address (VA)
        let (heap, va) = self.carve_va(size, align.max(page), flags)?;

        // 2. Create the driver allocation
        let created = match driver.create_allocation(&CreateAllocationArgs {
            device,
            allocation_info: vec![AllocationInfo::with_size(size)],
            flags: flags.to_create_flags(),
        }) {
            Ok(created) => created,
            Err(e) => {
                self.release_va(heap, va, size);
                return Err(e);
            }
        };
        let Some(&handle) = created.allocations.first() else {
            self.release_va(heap, va, size);
            return Err(KmtError::OperationFailed("driver returned no allocation".into()));
        };
        let undo_create = |mm: &mut Self| {
            let result = driver.destroy_allocation(&DestroyAllocationArgs {
                device,
                allocations: vec![handle],
                resource: created.resource.unwrap_or(KmtHandle::NULL),
            });
            warn_on_teardown("allocation", handle, result);
            mm.release_va(heap, va, size);
        };

        // 3. Map to GPU at the carved VA
        let maximum_address = if heap == HeapKind::Svm {
            MAX_SVM_ADDRESS
        } else {
            driver.reserve_gpu_va(va, va + size - 1).maximum_address
        };
        let mapped = match driver.map_gpu_va(&MapGpuVaArgs {
            paging_queue,
            allocation: handle,
            base_address: va,
            minimum_address: va,
            maximum_address,
        }) {
            Ok(mapped) => mapped,
            Err(e) => {
                undo_create(self);
                return Err(e);
            }
        };

        // 4. Make resident
        let resident = match driver.make_resident(&MakeResidentArgs {
            paging_queue,
            allocations: vec![handle],
        }) {
            Ok(resident) => resident,
            Err(e) => {
                undo_create(self);
                return Err(e);
            }
        };

        // 5. Map to CPU
        let cpu_address = if flags.host_access {
            match driver.lock(device, handle) {
                Ok(ptr) => ptr as u64,
                Err(e) => {
                    undo_create(self);
                    return Err(e);
                }
            }
        } else {
            0
        };

        let allocation = Allocation {
            handle,
            resource: created.resource,
            gpu_va: mapped.value,
            size,
            cpu_address,
            heap,
            paging_fence: mapped.fence_value.max(resident.fence_value),
        };
        debug!(
            %handle,
            gpu_va = format_args!("0x{:x}", allocation.gpu_va),
            size,
            ?heap,
            "Memory allocated"
        );

        self.allocations.insert(handle, allocation.clone());
        Ok(allocation)
    }

    /// Allocates a buffer in the range shared with the CPU.
    ///
    /// # Errors
    /// As `allocate`.
    pub fn allocate_svm(
        &mut self,
        driver: &KmtDriver,
        device: KmtHandle,
        paging_queue: KmtHandle,
        size: u64,
    ) -> KmtResult<Allocation> {
        self.allocate(driver, device, paging_queue, size, 0, AllocFlags::new().svm())
    }

    /// Free a previously allocated memory region.
    ///
    /// # Errors
    /// `InvalidHandle` if this manager did not allocate `handle`; otherwise the driver's error.
    /// The VA range is released even when the driver rejects the destroy.
    pub fn free_memory(&mut self, driver: &KmtDriver, device: KmtHandle, handle: KmtHandle) -> KmtResult<()> {
        let Some(alloc) = self.allocations.remove(&handle) else {
            return Err(KmtError::InvalidHandle {
                kind: ObjectKind::Allocation,
                handle,
            });
        };

        // 1. Unlock CPU mapping
        if alloc.is_host_visible()
            && let Err(e) = driver.unlock(device, handle)
        {
            warn!(%handle, error = %e, "Failed to unlock allocation");
        }

        // 2. Free GPU allocation (and its resource)
        let result = driver.destroy_allocation(&DestroyAllocationArgs {
            device,
            allocations: vec![handle],
            resource: alloc.resource.unwrap_or(KmtHandle::NULL),
        });

        // 3. Free VA
        self.release_va(alloc.heap, alloc.gpu_va, alloc.size);
        result
    }

    #[must_use]
    pub fn allocation(&self, handle: KmtHandle) -> Option<&Allocation> {
        self.allocations.get(&handle)
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Bytes of VA currently carved from `heap`, guard pages included.
    #[must_use]
    pub fn heap_usage(&self, heap: HeapKind) -> u64 {
        match heap {
            HeapKind::Standard => self.standard.used(),
            HeapKind::Standard64Kb => self.standard64kb.used(),
            HeapKind::Svm => self.svm.as_ref().map_or(0, Aperture::used),
            HeapKind::Heap32(i) => self.heap32.get(i).map_or(0, Aperture::used),
        }
    }
}
