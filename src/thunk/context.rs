use crate::error::{KmtError, KmtResult};
use crate::gmm::client_context::{ClientContext, GmmLibrary};
use crate::gmm::hw_info::HardwareInfo;
use crate::gmm::page_table::{PageTableManager, TranslationTableCallbacks, TranslationTableFlags};
use crate::kmt::adapter::AdapterInfo;
use crate::kmt::args::Luid;
use crate::kmt::device::{KmtDriver, warn_on_teardown};
use crate::kmt::fence::MonitoredFence;
use crate::kmt::handle::KmtHandle;
use crate::thunk::memory::{AllocFlags, Allocation, MemoryManager};
use crate::thunk::queues::QueueBuilder;
use crate::utils::PAGE_SIZE_64K;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Size of the aux-table root (L3) allocation.
const PAGE_TABLE_ROOT_SIZE: u64 = PAGE_SIZE_64K;

#[derive(Debug)]
struct PageTable {
    manager: PageTableManager,
    root: KmtHandle,
}

/// Driver objects created while opening a session, before the heaps are laid out.
struct SessionParts {
    device: KmtHandle,
    paging_queue: KmtHandle,
    adapter_info: AdapterInfo,
    paging_fence: MonitoredFence,
    client_context: Arc<ClientContext>,
}

/// One opened device together with everything needed to place memory on it.
///
/// Owns the adapter, device and paging queue handles and releases them on drop.
#[derive(Debug)]
pub struct DeviceSession {
    driver: Arc<KmtDriver>,
    adapter: KmtHandle,
    device: KmtHandle,
    paging_queue: KmtHandle,
    adapter_info: AdapterInfo,
    /// Paging queue fence; map and residency results are waited on here.
    paging_fence: MonitoredFence,
    client_context: Arc<ClientContext>,

    // Lock order: page_table before memory.
    memory: Mutex<MemoryManager>,
    page_table: Mutex<Option<PageTable>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceSession {
    /// Brings up a device on the adapter identified by `luid`.
    ///
    /// # Errors
    /// The first failing driver call's error, or `Fatal` if the memory-management library
    /// hands out no client context. Everything created up to the failure is released again.
    pub fn open(driver: Arc<KmtDriver>, luid: Luid, library: Arc<dyn GmmLibrary>) -> KmtResult<Self> {
        let mut hw_info = *driver.hardware_info();
        hw_info.adjust_default_engine_type();

        // 1. Open the adapter
        let adapter = driver.open_adapter_from_luid(luid)?;

        match Self::bring_up(&driver, adapter, hw_info, library) {
            Ok(parts) => {
                info!(%adapter, device = %parts.device, paging_queue = %parts.paging_queue, "Device session opened");
                Ok(Self {
                    memory: Mutex::new(MemoryManager::new(&parts.adapter_info.gfx_partition)),
                    page_table: Mutex::new(None),
                    driver,
                    adapter,
                    device: parts.device,
                    paging_queue: parts.paging_queue,
                    adapter_info: parts.adapter_info,
                    paging_fence: parts.paging_fence,
                    client_context: parts.client_context,
                })
            }
            Err(e) => {
                warn_on_teardown("adapter", adapter, driver.close_adapter(adapter));
                Err(e)
            }
        }
    }

    fn bring_up(
        driver: &KmtDriver,
        adapter: KmtHandle,
        hw_info: HardwareInfo,
        library: Arc<dyn GmmLibrary>,
    ) -> KmtResult<SessionParts> {
        // 2. Query adapter info and create the device
        let adapter_info = driver.query_adapter_info(adapter)?;
        let device = driver.create_device(adapter)?;

        // 3. Paging queue and client context; destroying the device takes the queue with it
        let parts = driver.create_paging_queue(device).and_then(|paging| {
            Ok(SessionParts {
                device,
                paging_queue: paging.handle,
                adapter_info,
                paging_fence: driver.monitored_fence(paging.sync_object)?,
                client_context: ClientContext::new(hw_info, library)?,
            })
        });

        if parts.is_err() {
            warn_on_teardown("device", device, driver.destroy_device(device));
        }
        parts
    }

    #[must_use]
    pub const fn driver(&self) -> &Arc<KmtDriver> {
        &self.driver
    }

    #[must_use]
    pub const fn adapter(&self) -> KmtHandle {
        self.adapter
    }

    #[must_use]
    pub const fn device(&self) -> KmtHandle {
        self.device
    }

    #[must_use]
    pub const fn paging_queue(&self) -> KmtHandle {
        self.paging_queue
    }

    #[must_use]
    pub const fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter_info
    }

    #[must_use]
    pub const fn client_context(&self) -> &Arc<ClientContext> {
        &self.client_context
    }

    /// Hardware descriptor with the default engine already adjusted for the stepping.
    #[must_use]
    pub fn hardware_info(&self) -> &HardwareInfo {
        self.client_context.hardware_info()
    }

    /// # Errors
    /// See [`MemoryManager::allocate`].
    pub fn allocate(&self, size: u64, align: u64, flags: AllocFlags) -> KmtResult<Allocation> {
        lock(&self.memory).allocate(&self.driver, self.device, self.paging_queue, size, align, flags)
    }

    /// # Errors
    /// See [`MemoryManager::free_memory`].
    pub fn free(&self, handle: KmtHandle) -> KmtResult<()> {
        lock(&self.memory).free_memory(&self.driver, self.device, handle)
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        lock(&self.memory).live_allocations()
    }

    /// Waits until the paging queue has retired `value`.
    #[must_use]
    pub fn wait_paging_fence(&self, value: u64, timeout: Duration) -> bool {
        self.paging_fence.wait(value, timeout)
    }

    /// Publishes outstanding paging work. Only needed with deferred completion.
    ///
    /// # Errors
    /// `InvalidHandle` if the paging queue has been destroyed underneath the session.
    pub fn complete_paging_operations(&self) -> KmtResult<u64> {
        self.driver.complete_paging_operations(self.paging_queue)
    }

    #[must_use]
    pub fn queue_builder(&self) -> QueueBuilder {
        QueueBuilder::new(self.driver.clone(), self.device)
    }

    /// Creates the aux translation table manager, placing its root table in device memory.
    /// Later calls keep the existing manager.
    ///
    /// # Errors
    /// The allocation error for the root table.
    pub fn init_page_table_manager(&self, callbacks: Arc<dyn TranslationTableCallbacks>) -> KmtResult<()> {
        let mut page_table = lock(&self.page_table);
        if page_table.is_some() {
            debug!(device = %self.device, "Page table manager already created");
            return Ok(());
        }

        let root = self.allocate(PAGE_TABLE_ROOT_SIZE, PAGE_SIZE_64K, AllocFlags::new().use_64kb_pages())?;
        let manager =
            self.client_context
                .create_page_table_manager(TranslationTableFlags::AUX, callbacks, root.gpu_va);
        info!(
            device = %self.device,
            root_va = format_args!("0x{:x}", root.gpu_va),
            "Page table manager created"
        );
        *page_table = Some(PageTable {
            manager,
            root: root.handle,
        });
        Ok(())
    }

    #[must_use]
    pub fn has_page_table_manager(&self) -> bool {
        lock(&self.page_table).is_some()
    }

    /// Runs `f` against the page table manager.
    ///
    /// # Errors
    /// `Usage` before [`Self::init_page_table_manager`]; otherwise whatever `f` returns.
    pub fn with_page_table<R>(&self, f: impl FnOnce(&mut PageTableManager) -> KmtResult<R>) -> KmtResult<R> {
        let mut page_table = lock(&self.page_table);
        let page_table = page_table
            .as_mut()
            .ok_or_else(|| KmtError::Usage("page table manager not created".into()))?;
        f(&mut page_table.manager)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let page_table = lock(&self.page_table).take();
        if let Some(page_table) = page_table {
            let result = lock(&self.memory).free_memory(&self.driver, self.device, page_table.root);
            warn_on_teardown("page table root", page_table.root, result);
        }

        warn_on_teardown(
            "paging queue",
            self.paging_queue,
            self.driver.destroy_paging_queue(self.paging_queue),
        );
        warn_on_teardown("device", self.device, self.driver.destroy_device(self.device));
        warn_on_teardown("adapter", self.adapter, self.driver.close_adapter(self.adapter));
        info!(device = %self.device, "Device session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gmm::client_context::BuiltinGmmLibrary;
    use crate::gmm::page_table::{AuxSurface, CsrHandle};
    use crate::gmm::hw_info::EngineType;
    use crate::kmt::args::CommandBuffer;
    use crate::kmt::fence::CompletionMode;

    struct NoLibrary;

    impl GmmLibrary for NoLibrary {
        fn create_client_context(&self, _hw_info: &HardwareInfo) -> Option<u64> {
            None
        }

        fn destroy_client_context(&self, _handle: u64) {}
    }

    struct NullCallbacks;

    impl TranslationTableCallbacks for NullCallbacks {
        fn write_l3_address(&self, _csr: CsrHandle, _address: u64, _register_offset: u32) -> KmtResult<()> {
            Ok(())
        }
    }

    fn open(config: Config) -> (Arc<KmtDriver>, DeviceSession) {
        let driver = Arc::new(KmtDriver::new(config));
        let session = DeviceSession::open(driver.clone(), Luid::new(7, 0), Arc::new(BuiltinGmmLibrary::default()))
            .unwrap();
        (driver, session)
    }

    #[test]
    fn open_and_drop_release_everything() {
        let library = Arc::new(BuiltinGmmLibrary::default());
        let driver = Arc::new(KmtDriver::default());
        let session = DeviceSession::open(driver.clone(), Luid::new(7, 0), library.clone()).unwrap();
        assert_eq!(library.live_contexts(), 1);
        let adapter = session.adapter();
        let alloc = session.allocate(4096, 0, AllocFlags::new()).unwrap();
        assert!(session.wait_paging_fence(alloc.paging_fence, Duration::from_millis(10)));

        drop(session);
        assert_eq!(library.live_contexts(), 0);
        assert!(driver.query_adapter_info(adapter).is_err());
        assert!(driver.allocation_gpu_va(alloc.handle).is_err());
    }

    #[test]
    fn missing_client_context_rolls_back_device_and_adapter() {
        let driver = Arc::new(KmtDriver::default());
        let err = DeviceSession::open(driver.clone(), Luid::new(7, 0), Arc::new(NoLibrary)).unwrap_err();
        assert!(matches!(err, KmtError::Fatal(_)));

        // A fresh open on the same driver still works and nothing leaked.
        let session =
            DeviceSession::open(driver, Luid::new(7, 0), Arc::new(BuiltinGmmLibrary::default())).unwrap();
        assert_eq!(session.live_allocations(), 0);
    }

    #[test]
    fn zero_luid_is_rejected() {
        let driver = Arc::new(KmtDriver::default());
        let err = DeviceSession::open(driver, Luid::default(), Arc::new(BuiltinGmmLibrary::default())).unwrap_err();
        assert!(err.is_invalid_parameter());
    }

    #[test]
    fn page_table_requires_init() {
        let (_driver, session) = open(Config::default());
        assert!(matches!(
            session.with_page_table(|pt| Ok(pt.entry_count())),
            Err(KmtError::Usage(_))
        ));

        session.init_page_table_manager(Arc::new(NullCallbacks)).unwrap();
        session.init_page_table_manager(Arc::new(NullCallbacks)).unwrap();
        assert!(session.has_page_table_manager());
        assert_eq!(session.live_allocations(), 1);

        let surface = session.allocate(0x1_0000, 0, AllocFlags::new()).unwrap();
        let aux = AuxSurface {
            allocation: surface.handle,
            size: surface.size,
            compressed: true,
        };
        session
            .with_page_table(|pt| {
                assert_eq!(pt.root_va() % PAGE_SIZE_64K, 0);
                pt.set_csr_handle(CsrHandle(1))?;
                pt.init_context_aux_table_register(KmtHandle::NULL, EngineType::Rcs)?;
                pt.update_aux_table(surface.gpu_va, &aux, true)
            })
            .unwrap();
        assert_eq!(session.with_page_table(|pt| Ok(pt.entry_count())).unwrap(), 1);
    }

    #[test]
    fn deferred_paging_work_completes_on_request() {
        let (_driver, session) = open(Config::default().with_completion(CompletionMode::Deferred));
        let alloc = session.allocate(4096, 0, AllocFlags::new()).unwrap();
        assert!(!session.wait_paging_fence(alloc.paging_fence, Duration::from_millis(1)));
        assert_eq!(session.complete_paging_operations().unwrap(), alloc.paging_fence);
        assert!(session.wait_paging_fence(alloc.paging_fence, Duration::from_millis(1)));
    }

    #[test]
    fn queue_builder_targets_session_device() {
        let (_driver, session) = open(Config::default());
        let queue = session.queue_builder().create().unwrap();
        let value = queue.submit(CommandBuffer::default()).unwrap();
        assert_eq!(value, 1);
        assert_eq!(queue.engine(), session.hardware_info().capability_table.default_engine_type);
    }
}
