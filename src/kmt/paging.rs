//! Paging queues: VA reservation and mapping, residency, and the paging fence.
//!
//! Every map issues the next value on the paging queue's fence. Residency reports the value a
//! caller still has to wait for before the allocations are usable.

use crate::error::{KmtError, KmtResult};
use crate::kmt::args::{MakeResidentArgs, MapGpuVaArgs, PagingQueueInfo, PagingResult};
use crate::kmt::device::KmtDriver;
use crate::kmt::handle::KmtHandle;
use crate::kmt::objects::{Object, PagingQueueObject, SyncOwner};
use crate::kmt::va::{FaultBudget, VaReservation};
use tracing::debug;

impl KmtDriver {
    /// # Errors
    /// `InvalidHandle` for an unknown device.
    pub fn create_paging_queue(&self, device: KmtHandle) -> KmtResult<PagingQueueInfo> {
        let mut state = self.lock_state();
        state.device(device)?;
        let timeline = self.new_timeline()?;
        let fence_cpu_address = timeline.fence().cpu_address();

        let (handle, sync_object) = state.insert_owned_fence(
            device,
            timeline.clone(),
            Object::PagingQueue(PagingQueueObject {
                device,
                sync_object: KmtHandle::NULL,
                timeline,
            }),
            SyncOwner::PagingQueue,
            |queue, sync| {
                if let Some(queue) = queue.as_paging_queue_mut() {
                    queue.sync_object = sync;
                }
            },
        )?;

        debug!(%handle, %device, %sync_object, "Paging queue created");
        Ok(PagingQueueInfo {
            handle,
            sync_object,
            fence_cpu_address,
        })
    }

    /// Destroys the queue and its sync object. Map fences still pending on it are forgotten.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown queue.
    pub fn destroy_paging_queue(&self, paging_queue: KmtHandle) -> KmtResult<()> {
        let mut state = self.lock_state();
        let sync_object = state.paging_queue(paging_queue)?.sync_object;

        let affected: Vec<KmtHandle> = state
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj.as_allocation()
                    .is_some_and(|a| matches!(a.pending_map, Some((pq, _)) if pq == paging_queue))
            })
            .map(|(h, _)| h)
            .collect();
        for handle in affected {
            if let Ok(allocation) = state.allocation_mut(handle) {
                allocation.pending_map = None;
            }
        }

        state.objects.remove(sync_object);
        state.objects.remove(paging_queue);
        debug!(%paging_queue, "Paging queue destroyed");
        Ok(())
    }

    /// Records the bounds for the next map call. Replaces any outstanding reservation.
    pub fn reserve_gpu_va(&self, minimum_address: u64, maximum_address: u64) -> VaReservation {
        let reservation = self.lock_state().va.reserve(minimum_address, maximum_address);
        debug!(base = reservation.base, maximum_address, "GPU VA reserved");
        reservation
    }

    #[must_use]
    pub fn last_reservation(&self) -> Option<VaReservation> {
        self.lock_state().va.last_reservation()
    }

    /// Replaces the injected map-failure budget.
    pub fn set_map_fault_budget(&self, budget: FaultBudget) {
        self.lock_state().va.set_fault_budget(budget);
    }

    /// Maps an allocation. The result is pending until the paging fence reaches `fence_value`.
    ///
    /// # Errors
    /// * `InvalidHandle` for an unknown paging queue or allocation.
    /// * `InvalidParameter` when they belong to different devices.
    /// * `OutOfRange` for a rejected placement.
    /// * `OperationFailed` for an injected fault.
    pub fn map_gpu_va(&self, args: &MapGpuVaArgs) -> KmtResult<PagingResult<u64>> {
        let mut state = self.lock_state();
        let queue = state.paging_queue(args.paging_queue)?;
        let (device, timeline) = (queue.device, queue.timeline.clone());
        state.device_allocation(device, args.allocation)?;

        let va = state
            .va
            .resolve_map(args.base_address, args.minimum_address, args.maximum_address)?;

        let fence_value = timeline.advance();
        let allocation = state.allocation_mut(args.allocation)?;
        allocation.gpu_va = Some(va);
        allocation.pending_map = Some((args.paging_queue, fence_value));

        debug!(
            allocation = %args.allocation,
            paging_queue = %args.paging_queue,
            va = format_args!("0x{va:x}"),
            fence_value,
            "GPU VA mapped"
        );
        Ok(PagingResult::pending(va, fence_value))
    }

    /// Marks allocations resident. The returned fence value is the newest map on this queue that
    /// has not completed yet for any of them, or `0` when nothing is outstanding.
    ///
    /// # Errors
    /// `InvalidHandle` for unknown handles; `InvalidParameter` for an empty list or an allocation
    /// of another device.
    pub fn make_resident(&self, args: &MakeResidentArgs) -> KmtResult<PagingResult<()>> {
        if args.allocations.is_empty() {
            return Err(KmtError::InvalidParameter("no allocations to make resident".into()));
        }

        let mut state = self.lock_state();
        let queue = state.paging_queue(args.paging_queue)?;
        let device = queue.device;
        let completed = queue.timeline.fence().current_value();

        let mut fence_value = 0;
        for &handle in &args.allocations {
            let allocation = state.device_allocation(device, handle)?;
            if let Some((pq, value)) = allocation.pending_map
                && pq == args.paging_queue
                && value > completed
            {
                fence_value = fence_value.max(value);
            }
        }

        for &handle in &args.allocations {
            state.allocation_mut(handle)?.resident = true;
        }

        debug!(
            paging_queue = %args.paging_queue,
            count = args.allocations.len(),
            fence_value,
            "Allocations made resident"
        );
        Ok(PagingResult::pending((), fence_value))
    }

    /// # Errors
    /// `InvalidHandle` for an unknown allocation.
    pub fn is_resident(&self, allocation: KmtHandle) -> KmtResult<bool> {
        Ok(self.lock_state().allocation(allocation)?.resident)
    }

    /// Publishes every paging operation submitted so far. Only meaningful in deferred mode.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown queue.
    pub fn complete_paging_operations(&self, paging_queue: KmtHandle) -> KmtResult<u64> {
        let timeline = self.lock_state().paging_queue(paging_queue)?.timeline.clone();
        Ok(timeline.complete())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::KmtError;
    use crate::kmt::args::{
        AllocationInfo, CreateAllocationArgs, Luid, MakeResidentArgs, MapGpuVaArgs, Status,
    };
    use crate::kmt::device::KmtDriver;
    use crate::kmt::fence::CompletionMode;
    use crate::kmt::handle::KmtHandle;
    use crate::kmt::va::FaultBudget;
    use crate::utils::MAX_SVM_ADDRESS;

    struct Fixture {
        driver: KmtDriver,
        device: KmtHandle,
        paging_queue: KmtHandle,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            let driver = KmtDriver::new(config);
            let adapter = driver.open_adapter_from_luid(Luid::new(0x1234, 0)).unwrap();
            let device = driver.create_device(adapter).unwrap();
            let paging_queue = driver.create_paging_queue(device).unwrap().handle;
            Self {
                driver,
                device,
                paging_queue,
            }
        }

        fn allocation(&self) -> KmtHandle {
            self.driver
                .create_allocation(&CreateAllocationArgs {
                    device: self.device,
                    allocation_info: vec![AllocationInfo::with_size(0x1_0000)],
                    ..Default::default()
                })
                .unwrap()
                .allocations[0]
        }

        fn map(&self, allocation: KmtHandle, base: u64, min: u64, max: u64) -> Result<(u64, u64), KmtError> {
            let result = self.driver.map_gpu_va(&MapGpuVaArgs {
                paging_queue: self.paging_queue,
                allocation,
                base_address: base,
                minimum_address: min,
                maximum_address: max,
            })?;
            assert_eq!(result.status, Status::Pending);
            Ok((result.value, result.fence_value))
        }
    }

    #[test]
    fn map_fences_increase_per_queue() {
        let fx = Fixture::new(Config::default());
        let a = fx.allocation();
        let b = fx.allocation();
        assert_eq!(fx.map(a, 0, 0, 0).unwrap(), (0x1_0000, 1));
        assert_eq!(fx.map(b, 0, 0x20_0000, 0).unwrap(), (0x20_0000, 2));
        assert_eq!(fx.driver.allocation_gpu_va(b).unwrap(), Some(0x20_0000));
    }

    #[test]
    fn map_rejects_unknown_handles() {
        let fx = Fixture::new(Config::default());
        let err = fx.map(KmtHandle::NULL, 0, 0, 0).unwrap_err();
        assert!(err.is_invalid_parameter());
    }

    #[test]
    fn cross_device_map_is_rejected() {
        let fx = Fixture::new(Config::default());
        let adapter = fx.driver.open_adapter_from_luid(Luid::new(9, 0)).unwrap();
        let other = fx.driver.create_device(adapter).unwrap();
        let foreign = fx
            .driver
            .create_allocation(&CreateAllocationArgs {
                device: other,
                allocation_info: vec![AllocationInfo::with_size(4096)],
                ..Default::default()
            })
            .unwrap()
            .allocations[0];
        assert!(matches!(fx.map(foreign, 0, 0, 0), Err(KmtError::InvalidParameter(_))));
    }

    #[test]
    fn sentinel_maximum_maps_anywhere() {
        let fx = Fixture::new(Config::default());
        let a = fx.allocation();
        assert_eq!(fx.map(a, 0x5555_0000, 0, MAX_SVM_ADDRESS).unwrap().0, 0x5555_0000);
    }

    #[test]
    fn injected_faults_do_not_advance_fence() {
        let fx = Fixture::new(Config::default().with_map_fault_budget(FaultBudget::new(0, 2)));
        let a = fx.allocation();
        assert!(fx.map(a, 0, 0, 0).unwrap_err().is_retryable());
        assert!(fx.map(a, 0, 0, 0).unwrap_err().is_retryable());
        assert_eq!(fx.map(a, 0, 0, 0).unwrap(), (0x1_0000, 1));
    }

    #[test]
    fn fault_budget_can_be_rearmed() {
        let fx = Fixture::new(Config::default());
        let a = fx.allocation();
        fx.driver.set_map_fault_budget(FaultBudget::new(0, 1));
        assert!(fx.map(a, 0, 0, 0).is_err());
        assert!(fx.map(a, 0, 0, 0).is_ok());
    }

    #[test]
    fn make_resident_reports_outstanding_map_in_deferred_mode() {
        let fx = Fixture::new(Config::default().with_completion(CompletionMode::Deferred));
        let a = fx.allocation();
        let b = fx.allocation();
        fx.map(a, 0, 0, 0).unwrap();
        fx.map(b, 0, 0x40_0000, 0).unwrap();

        let result = fx
            .driver
            .make_resident(&MakeResidentArgs {
                paging_queue: fx.paging_queue,
                allocations: vec![a, b],
            })
            .unwrap();
        assert!(result.is_pending());
        assert_eq!(result.fence_value, 2);
        assert!(fx.driver.is_resident(a).unwrap());

        assert_eq!(fx.driver.complete_paging_operations(fx.paging_queue).unwrap(), 2);
        let result = fx
            .driver
            .make_resident(&MakeResidentArgs {
                paging_queue: fx.paging_queue,
                allocations: vec![a],
            })
            .unwrap();
        assert_eq!(result.fence_value, 0);
    }

    #[test]
    fn make_resident_validates_before_mutating() {
        let fx = Fixture::new(Config::default());
        let a = fx.allocation();
        let empty = MakeResidentArgs {
            paging_queue: fx.paging_queue,
            allocations: Vec::new(),
        };
        assert!(fx.driver.make_resident(&empty).unwrap_err().is_invalid_parameter());

        let with_stale = MakeResidentArgs {
            paging_queue: fx.paging_queue,
            allocations: vec![a, KmtHandle::from_raw(0xfff0_0001)],
        };
        assert!(fx.driver.make_resident(&with_stale).is_err());
        assert!(!fx.driver.is_resident(a).unwrap());
    }

    #[test]
    fn destroyed_paging_queue_is_rejected() {
        let fx = Fixture::new(Config::default().with_completion(CompletionMode::Deferred));
        let a = fx.allocation();
        fx.map(a, 0, 0, 0).unwrap();
        fx.driver.destroy_paging_queue(fx.paging_queue).unwrap();
        assert!(fx.map(a, 0, 0, 0).is_err());
        assert!(fx.driver.destroy_paging_queue(fx.paging_queue).is_err());

        let queue = fx.driver.create_paging_queue(fx.device).unwrap();
        let result = fx
            .driver
            .make_resident(&MakeResidentArgs {
                paging_queue: queue.handle,
                allocations: vec![a],
            })
            .unwrap();
        assert_eq!(result.fence_value, 0);
    }
}
