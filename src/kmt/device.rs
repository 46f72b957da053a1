//! The driver-interface context object and its boundary calls.
//!
//! Every call validates all of its handles before it mutates anything, so a rejected call has
//! no side effects. Registry state sits behind one mutex; each fence timeline has its own.

use crate::config::{Config, DriverConfig};
use crate::error::{KmtError, KmtResult};
use crate::gmm::hw_info::HardwareInfo;
use crate::kmt::adapter::AdapterInfo;
use crate::kmt::args::{
    CommandBuffer, CreateAllocationArgs, CreateAllocationOutput, CreateContextArgs,
    DestroyAllocationArgs, HwQueueInfo, Luid, OpenResourceOutput, ResourceInfo, SyncObjectInfo,
};
use crate::kmt::fence::{FencePool, FenceTimeline, INITIAL_FENCE_VALUE, MonitoredFence, SharedFencePool};
use crate::kmt::handle::{HandleTable, KmtHandle, ObjectKind};
use crate::kmt::objects::{
    AdapterObject, AllocationObject, ContextObject, DeviceObject, HostMapping, HwQueueObject,
    Object, PagingQueueObject, ResourceObject, SyncObjectRecord, SyncOwner,
};
use crate::kmt::va::VaSpace;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct DriverState {
    pub(crate) objects: HandleTable<Object>,
    pub(crate) va: VaSpace,
}

macro_rules! typed_lookup {
    ($($get:ident => $kind:ident, $cast:ident, $ty:ty;)*) => {
        $(
            pub(crate) fn $get(&self, handle: KmtHandle) -> KmtResult<&$ty> {
                self.objects
                    .get(handle)
                    .and_then(Object::$cast)
                    .ok_or(KmtError::InvalidHandle { kind: ObjectKind::$kind, handle })
            }
        )*
    };
}

macro_rules! typed_lookup_mut {
    ($($get:ident => $kind:ident, $cast:ident, $ty:ty;)*) => {
        $(
            pub(crate) fn $get(&mut self, handle: KmtHandle) -> KmtResult<&mut $ty> {
                self.objects
                    .get_mut(handle)
                    .and_then(Object::$cast)
                    .ok_or(KmtError::InvalidHandle { kind: ObjectKind::$kind, handle })
            }
        )*
    };
}

impl DriverState {
    typed_lookup! {
        adapter => Adapter, as_adapter, AdapterObject;
        device => Device, as_device, DeviceObject;
        context => Context, as_context, ContextObject;
        resource => Resource, as_resource, ResourceObject;
        allocation => Allocation, as_allocation, AllocationObject;
        paging_queue => PagingQueue, as_paging_queue, PagingQueueObject;
        sync_object => SyncObject, as_sync_object, SyncObjectRecord;
        hw_queue => HwQueue, as_hw_queue, HwQueueObject;
    }

    typed_lookup_mut! {
        resource_mut => Resource, as_resource_mut, ResourceObject;
        allocation_mut => Allocation, as_allocation_mut, AllocationObject;
    }

    /// Looks up an allocation and checks it was created on `device`.
    pub(crate) fn device_allocation(&self, device: KmtHandle, handle: KmtHandle) -> KmtResult<&AllocationObject> {
        let allocation = self.allocation(handle)?;
        if allocation.device != device {
            return Err(KmtError::InvalidParameter(format!(
                "allocation {handle} does not belong to device {device}"
            )));
        }
        Ok(allocation)
    }

    /// Every object transitively created under `root`, deepest first.
    fn descendants(&self, root: KmtHandle) -> Vec<KmtHandle> {
        let mut levels: Vec<Vec<KmtHandle>> = Vec::new();
        let mut frontier: HashSet<KmtHandle> = HashSet::from([root]);
        while !frontier.is_empty() {
            let level: Vec<KmtHandle> = self
                .objects
                .iter()
                .filter(|(_, obj)| obj.parent().is_some_and(|p| frontier.contains(&p)))
                .map(|(h, _)| h)
                .collect();
            frontier = level.iter().copied().collect();
            if !level.is_empty() {
                levels.push(level);
            }
        }
        levels.into_iter().rev().flatten().collect()
    }

    /// Removes `root` and every object it owns, returning how many were destroyed.
    pub(crate) fn remove_tree(&mut self, root: KmtHandle) -> usize {
        let doomed = self.descendants(root);
        let count = doomed.len() + 1;
        for handle in doomed {
            self.objects.remove(handle);
        }
        self.objects.remove(root);
        count
    }

    /// Inserts a queue object together with the sync object that owns its fence.
    /// `link` writes the sync-object handle back into the queue record.
    pub(crate) fn insert_owned_fence(
        &mut self,
        device: KmtHandle,
        timeline: Arc<FenceTimeline>,
        queue: Object,
        owner: fn(KmtHandle) -> SyncOwner,
        link: fn(&mut Object, KmtHandle),
    ) -> KmtResult<(KmtHandle, KmtHandle)> {
        let queue_handle = self.objects.insert(queue)?;
        let sync = Object::SyncObject(SyncObjectRecord {
            device,
            owner: owner(queue_handle),
            timeline,
        });
        let sync_handle = match self.objects.insert(sync) {
            Ok(handle) => handle,
            Err(e) => {
                self.objects.remove(queue_handle);
                return Err(e);
            }
        };
        if let Some(queue) = self.objects.get_mut(queue_handle) {
            link(queue, sync_handle);
        }
        Ok((queue_handle, sync_handle))
    }
}

/// An in-process kernel graphics driver interface.
///
/// Owns every handle it issues. Independent instances share nothing.
pub struct KmtDriver {
    config: DriverConfig,
    hardware: HardwareInfo,
    fences: SharedFencePool,
    state: Mutex<DriverState>,
}

impl fmt::Debug for KmtDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmtDriver")
            .field("config", &self.config)
            .field("platform", &self.hardware.platform)
            .field("objects", &self.lock_state().objects.len())
            .finish_non_exhaustive()
    }
}

impl Default for KmtDriver {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl KmtDriver {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let Config { driver, hardware } = config;
        info!(
            platform = ?hardware.platform,
            completion = ?driver.completion,
            "Driver interface initialized"
        );
        Self {
            state: Mutex::new(DriverState {
                objects: HandleTable::new(driver.max_handles),
                va: VaSpace::new(driver.map_fault_budget),
            }),
            fences: Arc::new(Mutex::new(FencePool::new())),
            config: driver,
            hardware,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub const fn hardware_info(&self) -> &HardwareInfo {
        &self.hardware
    }

    pub(crate) fn new_timeline(&self) -> KmtResult<Arc<FenceTimeline>> {
        let fence = MonitoredFence::new(&self.fences)?;
        Ok(Arc::new(FenceTimeline::new(fence, self.config.completion)))
    }

    // ===========================================================================================
    // Adapter
    // ===========================================================================================

    /// # Errors
    /// `InvalidParameter` for the zero identity.
    pub fn open_adapter_from_luid(&self, luid: Luid) -> KmtResult<KmtHandle> {
        if luid.is_zero() {
            return Err(KmtError::InvalidParameter("adapter LUID is zero".into()));
        }
        let handle = self
            .lock_state()
            .objects
            .insert(Object::Adapter(AdapterObject { luid }))?;
        debug!(%handle, ?luid, "Adapter opened");
        Ok(handle)
    }

    /// # Errors
    /// `InvalidHandle` for an unknown adapter, `Usage` while devices are still open on it.
    pub fn close_adapter(&self, adapter: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        state.adapter(adapter)?;
        let open_devices = state
            .objects
            .iter()
            .filter(|(_, obj)| obj.as_device().is_some_and(|d| d.adapter == adapter))
            .count();
        if open_devices != 0 {
            return Err(KmtError::Usage(format!(
                "adapter {adapter} still has {open_devices} open device(s)"
            )));
        }
        state.objects.remove(adapter);
        debug!(%adapter, "Adapter closed");
        Ok(())
    }

    /// # Errors
    /// `InvalidHandle` for an unknown adapter.
    pub fn query_adapter_info(&self, adapter: KmtHandle) -> KmtResult<AdapterInfo> {
        self.lock_state().adapter(adapter)?;
        Ok(AdapterInfo::from_hardware_info(&self.hardware))
    }

    // ===========================================================================================
    // Device
    // ===========================================================================================

    /// # Errors
    /// `InvalidHandle` for an unknown adapter.
    pub fn create_device(&self, adapter: KmtHandle) -> KmtResult<KmtHandle> {
        let mut state = self.lock_state();
        state.adapter(adapter)?;
        let handle = state.objects.insert(Object::Device(DeviceObject { adapter }))?;
        debug!(%handle, %adapter, "Device created");
        Ok(handle)
    }

    /// Destroys the device and everything created under it.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown device.
    pub fn destroy_device(&self, device: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        state.device(device)?;
        let destroyed = state.remove_tree(device);
        info!(%device, destroyed, "Device destroyed");
        Ok(())
    }

    // ===========================================================================================
    // Context
    // ===========================================================================================

    /// # Errors
    /// `InvalidHandle` for an unknown device; `InvalidParameter` when the private data and its
    /// declared size disagree.
    pub fn create_context(&self, args: &CreateContextArgs) -> KmtResult<KmtHandle> {
        let size = args.private_driver_data_size as usize;
        let private_driver_data = match (&args.private_driver_data, size) {
            (None, 0) => None,
            (Some(data), size) if size != 0 && size <= data.len() => Some(data[..size].to_vec()),
            (data, size) => {
                return Err(KmtError::InvalidParameter(format!(
                    "private driver data ({} bytes) does not match declared size {size}",
                    data.as_ref().map_or(0, Vec::len)
                )));
            }
        };

        let mut state = self.lock_state();
        state.device(args.device)?;
        let handle = state.objects.insert(Object::Context(ContextObject {
            device: args.device,
            node_ordinal: args.node_ordinal,
            engine_affinity: args.engine_affinity,
            private_driver_data,
        }))?;
        debug!(%handle, device = %args.device, node = args.node_ordinal, "Context created");
        Ok(handle)
    }

    /// Destroys the context and its hardware queues.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown context.
    pub fn destroy_context(&self, context: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        state.context(context)?;
        let destroyed = state.remove_tree(context);
        debug!(%context, destroyed, "Context destroyed");
        Ok(())
    }

    // ===========================================================================================
    // Allocation & Resource
    // ===========================================================================================

    /// Creates one allocation per entry of `allocation_info`, optionally grouped under a
    /// resource. A shared resource is globally named by its own handle.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown device; `InvalidParameter` for an empty list, a zero size,
    /// or a shared request without a resource.
    pub fn create_allocation(&self, args: &CreateAllocationArgs) -> KmtResult<CreateAllocationOutput> {
        if args.allocation_info.is_empty() {
            return Err(KmtError::InvalidParameter("no allocations requested".into()));
        }
        if let Some(i) = args.allocation_info.iter().position(|info| info.size == 0) {
            return Err(KmtError::InvalidParameter(format!("allocation {i} has zero size")));
        }
        if args.flags.create_shared && !args.flags.create_resource {
            return Err(KmtError::InvalidParameter(
                "shared allocations require a resource".into(),
            ));
        }

        let mut state = self.lock_state();
        state.device(args.device)?;

        let mut created = Vec::with_capacity(args.allocation_info.len() + 1);
        let result = (|| -> KmtResult<CreateAllocationOutput> {
            let resource = if args.flags.create_resource {
                let total_data: usize = args
                    .allocation_info
                    .iter()
                    .map(|info| info.private_driver_data.len())
                    .sum();
                let handle = state.objects.insert(Object::Resource(ResourceObject {
                    device: args.device,
                    allocations: Vec::new(),
                    shared: args.flags.create_shared,
                    private_driver_data_size: u32::try_from(total_data).unwrap_or(u32::MAX),
                }))?;
                created.push(handle);
                Some(handle)
            } else {
                None
            };

            let mut allocations = Vec::with_capacity(args.allocation_info.len());
            for info in &args.allocation_info {
                let handle = state.objects.insert(Object::Allocation(AllocationObject::new(
                    args.device,
                    resource,
                    info.size,
                    info.private_driver_data.clone(),
                )))?;
                created.push(handle);
                allocations.push(handle);
            }

            if let Some(resource) = resource {
                state.resource_mut(resource)?.allocations.clone_from(&allocations);
            }

            Ok(CreateAllocationOutput {
                resource,
                global_share: resource.filter(|_| args.flags.create_shared),
                allocations,
            })
        })();

        match result {
            Ok(output) => {
                debug!(
                    device = %args.device,
                    count = output.allocations.len(),
                    resource = ?output.resource,
                    "Allocations created"
                );
                Ok(output)
            }
            Err(e) => {
                for handle in created {
                    state.objects.remove(handle);
                }
                Err(e)
            }
        }
    }

    /// Destroys the listed allocations and, if given, the resource with everything it owns.
    ///
    /// # Errors
    /// `InvalidParameter` when neither allocations nor a resource are named; `InvalidHandle`
    /// for unknown handles; `Usage` when an allocation is still locked.
    pub fn destroy_allocation(&self, args: &DestroyAllocationArgs) -> KmtResult<()> {
        if args.allocations.is_empty() && args.resource.is_null() {
            return Err(KmtError::InvalidParameter(
                "nothing to destroy: no allocations and no resource".into(),
            ));
        }

        let mut state = self.lock_state();
        state.device(args.device)?;

        let mut doomed: Vec<KmtHandle> = Vec::new();
        for &handle in &args.allocations {
            state.device_allocation(args.device, handle)?;
            doomed.push(handle);
        }
        if !args.resource.is_null() {
            let resource = state.resource(args.resource)?;
            if resource.device != args.device {
                return Err(KmtError::InvalidParameter(format!(
                    "resource {} does not belong to device {}",
                    args.resource, args.device
                )));
            }
            doomed.extend(resource.allocations.iter().copied());
        }
        doomed.sort_unstable();
        doomed.dedup();

        for &handle in &doomed {
            if state.allocation(handle)?.lock_count != 0 {
                return Err(KmtError::Usage(format!("allocation {handle} is still locked")));
            }
        }

        for &handle in &doomed {
            if let Some(Object::Allocation(allocation)) = state.objects.remove(handle)
                && let Some(resource) = allocation.resource
                && let Ok(resource) = state.resource_mut(resource)
            {
                resource.allocations.retain(|&h| h != handle);
            }
        }
        if !args.resource.is_null() {
            state.objects.remove(args.resource);
        }

        debug!(device = %args.device, count = doomed.len(), resource = %args.resource, "Allocations destroyed");
        Ok(())
    }

    /// Opens a shared resource by its global share handle.
    ///
    /// # Errors
    /// `InvalidHandle` for unknown handles; `InvalidParameter` if the resource is not shared or
    /// lives on another adapter.
    pub fn open_resource(&self, device: KmtHandle, global_share: KmtHandle) -> KmtResult<OpenResourceOutput> {
        let state = self.lock_state();
        let resource = Self::shared_resource(&state, device, global_share)?;
        Ok(OpenResourceOutput {
            resource: global_share,
            allocations: resource.allocations.clone(),
        })
    }

    /// # Errors
    /// As `open_resource`.
    pub fn query_resource_info(&self, device: KmtHandle, global_share: KmtHandle) -> KmtResult<ResourceInfo> {
        let state = self.lock_state();
        let resource = Self::shared_resource(&state, device, global_share)?;
        Ok(ResourceInfo {
            num_allocations: u32::try_from(resource.allocations.len()).unwrap_or(u32::MAX),
            private_runtime_data_size: 0,
            total_private_driver_data_size: resource.private_driver_data_size,
        })
    }

    fn shared_resource<'a>(
        state: &'a DriverState,
        device: KmtHandle,
        global_share: KmtHandle,
    ) -> KmtResult<&'a ResourceObject> {
        let adapter = state.device(device)?.adapter;
        let resource = state.resource(global_share)?;
        if !resource.shared {
            return Err(KmtError::InvalidParameter(format!(
                "resource {global_share} is not shared"
            )));
        }
        if state.device(resource.device)?.adapter != adapter {
            return Err(KmtError::InvalidParameter(format!(
                "resource {global_share} belongs to another adapter"
            )));
        }
        Ok(resource)
    }

    /// Returns a CPU pointer to the allocation's backing. The backing stays put across
    /// lock/unlock cycles and is released when the allocation is destroyed.
    ///
    /// # Errors
    /// `InvalidParameter` for a null handle or an allocation of another device.
    pub fn lock(&self, device: KmtHandle, allocation: KmtHandle) -> KmtResult<*mut u8> {
        if device.is_null() || allocation.is_null() {
            return Err(KmtError::InvalidParameter("lock requires device and allocation".into()));
        }

        let mut state = self.lock_state();
        state.device(device)?;
        let size = state.device_allocation(device, allocation)?.size;

        let record = state.allocation_mut(allocation)?;
        if record.host.is_none() {
            record.host = Some(HostMapping::new(size)?);
        }
        record.lock_count += 1;
        let ptr = record.host.as_ref().map_or(std::ptr::null_mut(), HostMapping::as_ptr);
        debug!(%allocation, lock_count = record.lock_count, "Allocation locked");
        Ok(ptr)
    }

    /// # Errors
    /// `InvalidParameter` for a null handle; `Usage` if the allocation is not locked.
    pub fn unlock(&self, device: KmtHandle, allocation: KmtHandle) -> KmtResult<()> {
        if device.is_null() || allocation.is_null() {
            return Err(KmtError::InvalidParameter("unlock requires device and allocation".into()));
        }

        let mut state = self.lock_state();
        state.device(device)?;
        state.device_allocation(device, allocation)?;
        let record = state.allocation_mut(allocation)?;
        if record.lock_count == 0 {
            return Err(KmtError::Usage(format!("allocation {allocation} is not locked")));
        }
        record.lock_count -= 1;
        Ok(())
    }

    /// # Errors
    /// `InvalidHandle` for an unknown allocation.
    pub fn allocation_gpu_va(&self, allocation: KmtHandle) -> KmtResult<Option<u64>> {
        Ok(self.lock_state().allocation(allocation)?.gpu_va)
    }

    // ===========================================================================================
    // Synchronization objects
    // ===========================================================================================

    /// # Errors
    /// `InvalidHandle` for an unknown device.
    pub fn create_synchronization_object(&self, device: KmtHandle) -> KmtResult<SyncObjectInfo> {
        let mut state = self.lock_state();
        state.device(device)?;
        let timeline = self.new_timeline()?;
        let fence = timeline.fence().clone();
        let handle = state.objects.insert(Object::SyncObject(SyncObjectRecord {
            device,
            owner: SyncOwner::Standalone,
            timeline,
        }))?;
        debug!(%handle, %device, "Synchronization object created");
        Ok(SyncObjectInfo {
            handle,
            fence_cpu_address: fence.cpu_address(),
            fence_gpu_address: fence.gpu_address(),
        })
    }

    /// # Errors
    /// `InvalidHandle` for an unknown object; `Usage` for a fence owned by a queue.
    pub fn destroy_synchronization_object(&self, sync_object: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        let owner = state.sync_object(sync_object)?.owner;
        if owner != SyncOwner::Standalone {
            return Err(KmtError::Usage(format!(
                "sync object {sync_object} is owned by {owner:?}"
            )));
        }
        state.objects.remove(sync_object);
        debug!(%sync_object, "Synchronization object destroyed");
        Ok(())
    }

    /// The fence behind a synchronization object.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown object.
    pub fn monitored_fence(&self, sync_object: KmtHandle) -> KmtResult<MonitoredFence> {
        Ok(self.lock_state().sync_object(sync_object)?.timeline.fence().clone())
    }

    /// Publishes everything submitted against a sync object. Only meaningful in deferred mode.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown object.
    pub fn complete_sync_object(&self, sync_object: KmtHandle) -> KmtResult<u64> {
        let timeline = self.lock_state().sync_object(sync_object)?.timeline.clone();
        Ok(timeline.complete())
    }

    /// Submits on a context, signalling a standalone sync object's fence on completion.
    ///
    /// # Errors
    /// `InvalidHandle` for unknown handles; `InvalidParameter` if the sync object is owned by a
    /// queue or belongs to another device.
    pub fn submit_command(
        &self,
        context: KmtHandle,
        sync_object: KmtHandle,
        command: CommandBuffer,
    ) -> KmtResult<u64> {
        let timeline = {
            let state = self.lock_state();
            let device = state.context(context)?.device;
            let sync = state.sync_object(sync_object)?;
            if sync.device != device || sync.owner != SyncOwner::Standalone {
                return Err(KmtError::InvalidParameter(format!(
                    "sync object {sync_object} cannot monitor context {context}"
                )));
            }
            sync.timeline.clone()
        };

        let fence_value = timeline.advance();
        debug!(%context, %sync_object, fence_value, length = command.length, "Command submitted");
        Ok(fence_value)
    }

    // ===========================================================================================
    // Hardware queues
    // ===========================================================================================

    /// # Errors
    /// `InvalidHandle` for an unknown context.
    pub fn create_hw_queue(&self, context: KmtHandle) -> KmtResult<HwQueueInfo> {
        let mut state = self.lock_state();
        let device = state.context(context)?.device;
        let timeline = self.new_timeline()?;
        let fence = timeline.fence().clone();
        let (handle, progress_fence) = state.insert_owned_fence(
            device,
            timeline.clone(),
            Object::HwQueue(HwQueueObject {
                context,
                progress_fence: KmtHandle::NULL,
                timeline,
            }),
            SyncOwner::HwQueue,
            |queue, sync| {
                if let Some(queue) = queue.as_hw_queue_mut() {
                    queue.progress_fence = sync;
                }
            },
        )?;

        debug!(%handle, %context, %progress_fence, "Hardware queue created");
        Ok(HwQueueInfo {
            handle,
            progress_fence,
            progress_fence_cpu_address: fence.cpu_address(),
            progress_fence_gpu_address: fence.gpu_address(),
            initial_fence_value: INITIAL_FENCE_VALUE,
        })
    }

    /// Enqueues `command` and returns its fence value, strictly greater than any earlier value
    /// on the same queue. Contents are not inspected.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown queue.
    pub fn submit_command_to_hw_queue(&self, hw_queue: KmtHandle, command: CommandBuffer) -> KmtResult<u64> {
        let timeline = self.lock_state().hw_queue(hw_queue)?.timeline.clone();
        let fence_value = timeline.advance();
        debug!(%hw_queue, fence_value, length = command.length, "Submitted to hardware queue");
        Ok(fence_value)
    }

    /// # Errors
    /// `InvalidHandle` for an unknown queue.
    pub fn complete_hw_queue_submissions(&self, hw_queue: KmtHandle) -> KmtResult<u64> {
        let timeline = self.lock_state().hw_queue(hw_queue)?.timeline.clone();
        Ok(timeline.complete())
    }

    /// Destroys the queue and its progress fence.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown queue.
    pub fn destroy_hw_queue(&self, hw_queue: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        let progress_fence = state.hw_queue(hw_queue)?.progress_fence;
        state.objects.remove(progress_fence);
        state.objects.remove(hw_queue);
        debug!(%hw_queue, "Hardware queue destroyed");
        Ok(())
    }
}

/// Reports a teardown failure without propagating it.
pub(crate) fn warn_on_teardown(what: &str, handle: KmtHandle, result: KmtResult<()>) {
    if let Err(e) = result {
        warn!(%handle, error = %e, "Failed to destroy {what}");
    }
}
