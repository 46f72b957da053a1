//! Monitored fences: CPU-visible completion counters living in driver-owned fence pages.
//!
//! Every fence is a 64-byte slot carved out of an anonymous mapping. The value only ever
//! moves forward (`fetch_max`), so a reader can never observe it decreasing.

use crate::error::{KmtError, KmtResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// GPU address reported for every monitored fence. The simulated driver does not back fences
/// with GPU virtual memory.
pub const FENCE_GPU_VA_PLACEHOLDER: u64 = 3;

/// Fence value handed to the first submission on a fresh timeline.
pub const INITIAL_FENCE_VALUE: u64 = 1;

const SPIN_DURATION: Duration = Duration::from_micros(20);
const SLEEP_QUANTUM: Duration = Duration::from_micros(50);

#[repr(C, align(64))]
pub struct FenceSlot {
    value: AtomicU64,
    reserved: [u64; 7],
}

const _: () = assert!(std::mem::size_of::<FenceSlot>() == 64);

/// One anonymous mapping holding `len` fence slots.
struct FenceBlock {
    base: NonNull<FenceSlot>,
    bytes: usize,
}

impl Drop for FenceBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.bytes);
        }
    }
}

/// Manages fence slots with a growth factor, one mapping per block.
pub struct FencePool {
    free_list: Vec<NonNull<FenceSlot>>,
    blocks: Vec<FenceBlock>,
    next_block_slots: usize,
}

unsafe impl Send for FencePool {}

impl Default for FencePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FencePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FencePool")
            .field("free", &self.free_list.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl FencePool {
    /// One 4 KiB page worth of slots.
    const INITIAL_BLOCK_SLOTS: usize = 64;
    /// 64 KiB mapping.
    const MAX_BLOCK_SLOTS: usize = 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_list: Vec::new(),
            blocks: Vec::new(),
            next_block_slots: Self::INITIAL_BLOCK_SLOTS,
        }
    }

    fn grow(&mut self) -> KmtResult<()> {
        let num_slots = self.next_block_slots;
        let bytes = num_slots * std::mem::size_of::<FenceSlot>();

        // Anonymous mappings are zero-filled, which is a valid zero counter in every slot.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(KmtError::Io(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(raw.cast::<FenceSlot>())
            .ok_or_else(|| KmtError::OperationFailed("fence page mapped at null".into()))?;

        for i in (0..num_slots).rev() {
            self.free_list.push(unsafe { base.add(i) });
        }
        self.blocks.push(FenceBlock { base, bytes });
        self.next_block_slots = (num_slots * 2).min(Self::MAX_BLOCK_SLOTS);

        debug!(slots = num_slots, bytes, "Mapped fence block");
        Ok(())
    }

    fn alloc(&mut self) -> KmtResult<NonNull<FenceSlot>> {
        if self.free_list.is_empty() {
            self.grow()?;
        }
        self.free_list
            .pop()
            .ok_or_else(|| KmtError::OperationFailed("fence pool exhausted".into()))
    }

    fn free(&mut self, slot: NonNull<FenceSlot>) {
        unsafe {
            (*slot.as_ptr()).value.store(0, Ordering::Relaxed);
        }
        self.free_list.push(slot);
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free_list.len()
    }
}

pub type SharedFencePool = Arc<Mutex<FencePool>>;

fn lock_pool(pool: &SharedFencePool) -> MutexGuard<'_, FencePool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FenceCell {
    slot: NonNull<FenceSlot>,
    gpu_va: u64,
    pool: SharedFencePool,
}

unsafe impl Send for FenceCell {}
unsafe impl Sync for FenceCell {}

impl Drop for FenceCell {
    fn drop(&mut self) {
        lock_pool(&self.pool).free(self.slot);
    }
}

/// A CPU/GPU-visible monotonic completion counter.
///
/// Clones share the same counter; the slot returns to its pool when the last clone drops.
#[derive(Clone)]
pub struct MonitoredFence {
    cell: Arc<FenceCell>,
}

impl fmt::Debug for MonitoredFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredFence")
            .field("cpu_address", &format_args!("0x{:x}", self.cpu_address()))
            .field("gpu_address", &self.gpu_address())
            .field("value", &self.current_value())
            .finish()
    }
}

impl MonitoredFence {
    pub(crate) fn new(pool: &SharedFencePool) -> KmtResult<Self> {
        let slot = lock_pool(pool).alloc()?;
        Ok(Self {
            cell: Arc::new(FenceCell {
                slot,
                gpu_va: FENCE_GPU_VA_PLACEHOLDER,
                pool: pool.clone(),
            }),
        })
    }

    #[inline]
    fn atomic_val(&self) -> &AtomicU64 {
        unsafe { &(*self.cell.slot.as_ptr()).value }
    }

    /// Process address of the counter.
    #[must_use]
    pub fn cpu_address(&self) -> u64 {
        self.atomic_val().as_ptr() as u64
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.cell.gpu_va
    }

    #[inline]
    #[must_use]
    pub fn current_value(&self) -> u64 {
        self.atomic_val().load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_reached(&self, value: u64) -> bool {
        self.current_value() >= value
    }

    /// Publishes `value`; a lower value than the current one is ignored.
    /// Returns the value observed before the store.
    pub(crate) fn signal(&self, value: u64) -> u64 {
        self.atomic_val().fetch_max(value, Ordering::AcqRel)
    }

    /// Polls until the counter reaches `value` or `timeout` elapses.
    /// Spins briefly, then sleeps in short quanta.
    pub fn wait(&self, value: u64, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_reached(value) {
                return true;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return self.is_reached(value);
            }

            if elapsed < SPIN_DURATION {
                std::hint::spin_loop();
            } else {
                thread::sleep(SLEEP_QUANTUM.min(timeout - elapsed));
            }
        }
    }

    #[must_use]
    pub fn same_counter(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// When the simulated GPU reports completion of submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Work completes as soon as it is submitted.
    #[default]
    Immediate,
    /// Work completes only when explicitly retired.
    Deferred,
}

#[derive(Debug, Default)]
struct TimelineState {
    last_submitted: u64,
}

/// Ordering state of one fence: every submission gets the next value, strictly increasing.
///
/// Enqueue and fence advance happen under the timeline's own lock, so concurrent submitters
/// to one queue are serialized while different queues never contend.
#[derive(Debug)]
pub struct FenceTimeline {
    fence: MonitoredFence,
    mode: CompletionMode,
    state: Mutex<TimelineState>,
}

impl FenceTimeline {
    #[must_use]
    pub fn new(fence: MonitoredFence, mode: CompletionMode) -> Self {
        Self {
            fence,
            mode,
            state: Mutex::new(TimelineState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn fence(&self) -> &MonitoredFence {
        &self.fence
    }

    /// Assigns the next fence value to a submission.
    pub fn advance(&self) -> u64 {
        let mut state = self.lock_state();
        let value = if state.last_submitted == 0 {
            INITIAL_FENCE_VALUE
        } else {
            state.last_submitted + 1
        };
        state.last_submitted = value;

        if self.mode == CompletionMode::Immediate {
            self.fence.signal(value);
        }
        value
    }

    /// Publishes every submitted value to the fence. Returns the published value.
    pub fn complete(&self) -> u64 {
        let state = self.lock_state();
        let previous = self.fence.signal(state.last_submitted);
        if previous > state.last_submitted {
            warn!(previous, submitted = state.last_submitted, "Fence ahead of its timeline");
        }
        state.last_submitted
    }
}
