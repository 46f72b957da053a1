use kmt_rs::gmm::BuiltinGmmLibrary;
use kmt_rs::kmt::args::{CommandBuffer, Luid};
use kmt_rs::thunk::memory::AllocFlags;
use kmt_rs::thunk::queues::QueueInterface;
use kmt_rs::{DeviceSession, KmtDriver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SUBMITTERS: usize = 4;
const SUBMISSIONS_PER_THREAD: usize = 16;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("============================================================");
    println!("              KMT - Hardware Queue Submission               ");
    println!("============================================================");

    let driver = Arc::new(KmtDriver::default());
    let session = DeviceSession::open(driver, Luid::new(1, 0), Arc::new(BuiltinGmmLibrary::default()))?;
    println!(
        "[+] Device {} on {:?}, default engine {:?}",
        session.device(),
        session.hardware_info().platform.product_family,
        session.hardware_info().capability_table.default_engine_type
    );

    // A batch buffer for the commands to point at.
    let batch = session.allocate(0x1000, 0, AllocFlags::new().host_access())?;
    println!("[+] Batch buffer at GPU VA 0x{:x}", batch.gpu_va);

    for interface in [QueueInterface::Interface23, QueueInterface::Interface20] {
        let queue = Arc::new(session.queue_builder().with_interface(interface).create()?);
        println!("[+] {interface:?} queue on context {}", queue.context());

        let handles: Vec<_> = (0..SUBMITTERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let command = CommandBuffer {
                    gpu_address: batch.gpu_va,
                    length: 64,
                };
                thread::spawn(move || {
                    (0..SUBMISSIONS_PER_THREAD)
                        .map(|_| queue.submit(command))
                        .collect::<Result<Vec<u64>, _>>()
                })
            })
            .collect();

        let mut last = 0;
        for handle in handles {
            let values = handle.join().map_err(|_| "submitter panicked")??;
            last = last.max(values.last().copied().unwrap_or(0));
        }

        let reached = queue.wait(last, Duration::from_millis(100));
        println!("    Last fence value {last}, reached: {reached}");
    }

    session.free(batch.handle)?;
    println!("[+] Done.");
    Ok(())
}
