//! Records stored behind driver handles.

use crate::error::{KmtError, KmtResult};
use crate::kmt::args::Luid;
use crate::kmt::fence::FenceTimeline;
use crate::kmt::handle::{KmtHandle, ObjectKind};
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// CPU-visible backing of a locked allocation.
#[derive(Debug)]
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    pub fn new(len: u64) -> KmtResult<Self> {
        let len = usize::try_from(len.max(1))
            .map_err(|_| KmtError::InvalidParameter(format!("cannot map 0x{len:x} bytes")))?;
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(KmtError::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| KmtError::OperationFailed("host mapping at null".into()))?;
        Ok(Self { ptr, len })
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[derive(Debug)]
pub struct AdapterObject {
    pub luid: Luid,
}

#[derive(Debug)]
pub struct DeviceObject {
    pub adapter: KmtHandle,
}

#[derive(Debug)]
pub struct ContextObject {
    pub device: KmtHandle,
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    pub private_driver_data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct ResourceObject {
    pub device: KmtHandle,
    pub allocations: Vec<KmtHandle>,
    pub shared: bool,
    pub private_driver_data_size: u32,
}

#[derive(Debug)]
pub struct AllocationObject {
    pub device: KmtHandle,
    pub resource: Option<KmtHandle>,
    pub size: u64,
    pub private_driver_data: Vec<u8>,
    pub gpu_va: Option<u64>,
    pub resident: bool,
    /// Latest map fence issued for this allocation: `(paging queue, value)`.
    pub pending_map: Option<(KmtHandle, u64)>,
    pub lock_count: u32,
    pub host: Option<HostMapping>,
}

impl AllocationObject {
    pub fn new(device: KmtHandle, resource: Option<KmtHandle>, size: u64, data: Vec<u8>) -> Self {
        Self {
            device,
            resource,
            size,
            private_driver_data: data,
            gpu_va: None,
            resident: false,
            pending_map: None,
            lock_count: 0,
            host: None,
        }
    }
}

#[derive(Debug)]
pub struct PagingQueueObject {
    pub device: KmtHandle,
    pub sync_object: KmtHandle,
    pub timeline: Arc<FenceTimeline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOwner {
    Standalone,
    PagingQueue(KmtHandle),
    HwQueue(KmtHandle),
}

#[derive(Debug)]
pub struct SyncObjectRecord {
    pub device: KmtHandle,
    pub owner: SyncOwner,
    pub timeline: Arc<FenceTimeline>,
}

#[derive(Debug)]
pub struct HwQueueObject {
    pub context: KmtHandle,
    pub progress_fence: KmtHandle,
    pub timeline: Arc<FenceTimeline>,
}

/// Everything a handle can name. One table serves all kinds; the tag is checked on lookup.
#[derive(Debug)]
pub enum Object {
    Adapter(AdapterObject),
    Device(DeviceObject),
    Context(ContextObject),
    Resource(ResourceObject),
    Allocation(AllocationObject),
    PagingQueue(PagingQueueObject),
    SyncObject(SyncObjectRecord),
    HwQueue(HwQueueObject),
}

impl Object {
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Adapter(_) => ObjectKind::Adapter,
            Self::Device(_) => ObjectKind::Device,
            Self::Context(_) => ObjectKind::Context,
            Self::Resource(_) => ObjectKind::Resource,
            Self::Allocation(_) => ObjectKind::Allocation,
            Self::PagingQueue(_) => ObjectKind::PagingQueue,
            Self::SyncObject(_) => ObjectKind::SyncObject,
            Self::HwQueue(_) => ObjectKind::HwQueue,
        }
    }

    /// The handle this object was created under, if it has a parent. A queue's fence belongs to
    /// the queue, so destroying the queue's ancestors takes the fence with it.
    pub const fn parent(&self) -> Option<KmtHandle> {
        match self {
            Self::Adapter(_) => None,
            Self::Device(d) => Some(d.adapter),
            Self::Context(c) => Some(c.device),
            Self::Resource(r) => Some(r.device),
            Self::Allocation(a) => Some(a.device),
            Self::PagingQueue(p) => Some(p.device),
            Self::SyncObject(s) => match s.owner {
                SyncOwner::Standalone => Some(s.device),
                SyncOwner::PagingQueue(queue) | SyncOwner::HwQueue(queue) => Some(queue),
            },
            Self::HwQueue(q) => Some(q.context),
        }
    }
}

macro_rules! object_accessors {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl Object {
            $(
                pub const fn $get(&self) -> Option<&$ty> {
                    match self {
                        Self::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                pub const fn $get_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Self::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }
    };
}

object_accessors! {
    Adapter => AdapterObject, as_adapter, as_adapter_mut;
    Device => DeviceObject, as_device, as_device_mut;
    Context => ContextObject, as_context, as_context_mut;
    Resource => ResourceObject, as_resource, as_resource_mut;
    Allocation => AllocationObject, as_allocation, as_allocation_mut;
    PagingQueue => PagingQueueObject, as_paging_queue, as_paging_queue_mut;
    SyncObject => SyncObjectRecord, as_sync_object, as_sync_object_mut;
    HwQueue => HwQueueObject, as_hw_queue, as_hw_queue_mut;
}
