use kmt_rs::kmt::args::{
    AllocationInfo, CreateAllocationArgs, DestroyAllocationArgs, Luid, MakeResidentArgs,
    MapGpuVaArgs, Status,
};
use kmt_rs::kmt::va::FaultBudget;
use kmt_rs::{Config, KmtDriver, KmtError, KmtHandle};

struct Setup {
    driver: KmtDriver,
    device: KmtHandle,
    paging_queue: KmtHandle,
}

fn setup(config: Config) -> Setup {
    let driver = KmtDriver::new(config);
    let adapter = driver.open_adapter_from_luid(Luid::new(0x1234, 0)).unwrap();
    let device = driver.create_device(adapter).unwrap();
    let paging_queue = driver.create_paging_queue(device).unwrap().handle;
    Setup {
        driver,
        device,
        paging_queue,
    }
}

impl Setup {
    fn allocation(&self, size: u64) -> KmtHandle {
        self.driver
            .create_allocation(&CreateAllocationArgs {
                device: self.device,
                allocation_info: vec![AllocationInfo::with_size(size)],
                ..Default::default()
            })
            .unwrap()
            .allocations[0]
    }

    fn map(&self, allocation: KmtHandle, base: u64, min: u64, max: u64) -> Result<(u64, u64), KmtError> {
        self.driver
            .map_gpu_va(&MapGpuVaArgs {
                paging_queue: self.paging_queue,
                allocation,
                base_address: base,
                minimum_address: min,
                maximum_address: max,
            })
            .map(|r| (r.value, r.fence_value))
    }
}

#[test]
fn end_to_end_paging_flow() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1_0000);

    let reservation = s.driver.reserve_gpu_va(0x1_0000, 0x7FFF_FFFF);
    let mapped = s
        .driver
        .map_gpu_va(&MapGpuVaArgs {
            paging_queue: s.paging_queue,
            allocation,
            base_address: 0,
            minimum_address: reservation.minimum_address,
            maximum_address: reservation.maximum_address,
        })
        .unwrap();
    assert_eq!(mapped.value, 0x1_0000);
    assert_eq!(mapped.status, Status::Pending);
    assert_eq!(mapped.fence_value, 1);

    let resident = s
        .driver
        .make_resident(&MakeResidentArgs {
            paging_queue: s.paging_queue,
            allocations: vec![allocation],
        })
        .unwrap();
    assert_eq!(resident.status, Status::Pending);
    assert_eq!(resident.fence_value, 0);

    s.driver
        .destroy_allocation(&DestroyAllocationArgs {
            device: s.device,
            allocations: vec![allocation],
            ..Default::default()
        })
        .unwrap();
}

#[test]
fn unplaced_map_is_idempotent() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);
    let first = s.map(allocation, 0, 0, 0).unwrap();
    let second = s.map(allocation, 0, 0, 0).unwrap();
    assert_eq!(first.0, 0x1_0000);
    assert_eq!(first.0, second.0);
    assert!(second.1 > first.1);

    assert_eq!(s.map(allocation, 0, 0x20_0000, 0).unwrap().0, 0x20_0000);
}

#[test]
fn two_injected_faults_then_success() {
    let s = setup(Config::default().with_map_fault_budget(FaultBudget::new(0, 2)));
    let allocation = s.allocation(0x1000);
    for _ in 0..2 {
        let err = s.map(allocation, 0, 0x1_0000, 0x7FFF_FFFF).unwrap_err();
        assert!(matches!(err, KmtError::OperationFailed(_)));
        assert!(err.is_retryable());
    }
    let (va, fence) = s.map(allocation, 0, 0x1_0000, 0x7FFF_FFFF).unwrap();
    assert_eq!(va, 0x1_0000);
    assert_eq!(fence, 1);
}

#[test]
fn faults_can_be_armed_at_runtime() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);
    s.driver.set_map_fault_budget(FaultBudget::new(0, 1));
    assert!(s.map(allocation, 0, 0, 0).is_err());
    assert!(s.map(allocation, 0, 0, 0).is_ok());
}

#[test]
fn requested_base_outside_bounds_is_out_of_range() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);

    let err = s.map(allocation, 0x8000, 0x1_0000, 0x7FFF_FFFF).unwrap_err();
    assert!(matches!(err, KmtError::OutOfRange { address: 0x8000, .. }));

    let err = s.map(allocation, 0x8000_0000, 0x1_0000, 0x7FFF_FFFF).unwrap_err();
    assert!(matches!(err, KmtError::OutOfRange { .. }));

    // In bounds, but neither the sentinel nor a reserved base.
    let err = s.map(allocation, 0x2_0000, 0x1_0000, 0x7FFF_FFFF).unwrap_err();
    assert!(matches!(err, KmtError::OutOfRange { .. }));
    assert_eq!(s.driver.allocation_gpu_va(allocation).unwrap(), None);
}

#[test]
fn reserved_base_is_accepted_once() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);
    s.driver.reserve_gpu_va(0x40_0000, 0x40_ffff);
    assert_eq!(s.map(allocation, 0x40_0000, 0x40_0000, 0x40_ffff).unwrap().0, 0x40_0000);
    assert!(s.driver.last_reservation().is_none());
    assert!(s.map(allocation, 0x40_0000, 0x40_0000, 0x40_ffff).is_err());
}

#[test]
fn destroy_allocation_requires_something_to_destroy() {
    let s = setup(Config::default());
    let err = s
        .driver
        .destroy_allocation(&DestroyAllocationArgs {
            device: s.device,
            ..Default::default()
        })
        .unwrap_err();
    assert!(err.is_invalid_parameter());

    let created = s
        .driver
        .create_allocation(&CreateAllocationArgs {
            device: s.device,
            allocation_info: vec![AllocationInfo::with_size(0x1000); 2],
            flags: kmt_rs::kmt::args::CreateAllocationFlags {
                create_resource: true,
                create_shared: false,
            },
        })
        .unwrap();
    s.driver
        .destroy_allocation(&DestroyAllocationArgs {
            device: s.device,
            allocations: Vec::new(),
            resource: created.resource.unwrap(),
        })
        .unwrap();
    for handle in created.allocations {
        assert!(s.driver.allocation_gpu_va(handle).is_err());
    }
}

#[test]
fn destroying_the_device_invalidates_children() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);
    s.driver.destroy_device(s.device).unwrap();
    assert!(s.driver.allocation_gpu_va(allocation).is_err());
    assert!(s.driver.complete_paging_operations(s.paging_queue).is_err());
}

#[test]
fn paging_queue_reports_its_fence_address() {
    let s = setup(Config::default());
    let info = s.driver.create_paging_queue(s.device).unwrap();
    let fence = s.driver.monitored_fence(info.sync_object).unwrap();
    assert_eq!(info.fence_cpu_address, fence.cpu_address());
    assert_ne!(info.fence_cpu_address, 0);
}

#[test]
fn destroyed_paging_queue_is_rejected() {
    let s = setup(Config::default());
    let allocation = s.allocation(0x1000);
    let info = s.driver.create_paging_queue(s.device).unwrap();
    s.driver.destroy_paging_queue(info.handle).unwrap();

    let err = s
        .driver
        .make_resident(&MakeResidentArgs {
            paging_queue: info.handle,
            allocations: vec![allocation],
        })
        .unwrap_err();
    assert!(matches!(err, KmtError::InvalidHandle { .. }));
    assert!(!s.driver.is_resident(allocation).unwrap());
    assert!(s.driver.monitored_fence(info.sync_object).is_err());
}
