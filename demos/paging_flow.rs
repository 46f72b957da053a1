use kmt_rs::kmt::args::{
    AllocationInfo, CreateAllocationArgs, DestroyAllocationArgs, Luid, MakeResidentArgs,
    MapGpuVaArgs,
};
use kmt_rs::{Config, KmtDriver};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("============================================================");
    println!("              KMT - Paging Queue Walkthrough                ");
    println!("============================================================");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };
    let driver = KmtDriver::new(config);

    // 1. Adapter and device
    println!("[+] Opening adapter...");
    let adapter = driver.open_adapter_from_luid(Luid::new(1, 0))?;
    let info = driver.query_adapter_info(adapter)?;
    println!(
        "    Platform: {:?} / {:?}",
        info.platform.product_family, info.platform.render_core_family
    );
    println!("    GPU address space: 0x{:x}", info.gpu_address_space);
    let device = driver.create_device(adapter)?;

    // 2. Paging queue
    let paging = driver.create_paging_queue(device)?;
    let fence = driver.monitored_fence(paging.sync_object)?;
    println!("[+] Paging queue {} (fence at 0x{:x})", paging.handle, paging.fence_cpu_address);

    // 3. Allocation
    let created = driver.create_allocation(&CreateAllocationArgs {
        device,
        allocation_info: vec![AllocationInfo::with_size(0x1_0000)],
        ..Default::default()
    })?;
    let allocation = created.allocations[0];
    println!("[+] Allocation {allocation}");

    // 4. Reserve, map, make resident
    let reservation = driver.reserve_gpu_va(0x1_0000, 0x7FFF_FFFF);
    let mapped = driver.map_gpu_va(&MapGpuVaArgs {
        paging_queue: paging.handle,
        allocation,
        base_address: 0,
        minimum_address: reservation.minimum_address,
        maximum_address: reservation.maximum_address,
    })?;
    println!(
        "[+] Mapped at 0x{:x}, status {:?}, paging fence {}",
        mapped.value, mapped.status, mapped.fence_value
    );

    let resident = driver.make_resident(&MakeResidentArgs {
        paging_queue: paging.handle,
        allocations: vec![allocation],
    })?;
    println!("[+] Resident, wait for paging fence {}", resident.fence_value);

    let wait_for = mapped.fence_value.max(resident.fence_value);
    if !fence.wait(wait_for, Duration::from_millis(100)) {
        driver.complete_paging_operations(paging.handle)?;
    }
    println!("    Paging fence now {}", fence.current_value());

    // 5. Teardown
    driver.destroy_allocation(&DestroyAllocationArgs {
        device,
        allocations: vec![allocation],
        ..Default::default()
    })?;
    driver.destroy_paging_queue(paging.handle)?;
    driver.destroy_device(device)?;
    driver.close_adapter(adapter)?;
    println!("[+] Done.");
    Ok(())
}
