use crate::error::KmtResult;
use crate::gmm::hw_info::{EngineType, HardwareInfo, RenderCoreFamily};
use crate::kmt::args::{CommandBuffer, CreateContextArgs};
use crate::kmt::device::{KmtDriver, warn_on_teardown};
use crate::kmt::fence::MonitoredFence;
use crate::kmt::handle::KmtHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which driver-interface revision a queue is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueInterface {
    /// Submission on the context, progress tracked by a standalone monitored fence.
    Interface20,
    /// Hardware queue whose progress fence doubles as the monitor fence.
    Interface23,
}

impl QueueInterface {
    /// Hardware queues are used from Gen12LP on.
    #[must_use]
    pub const fn for_hardware(hw: &HardwareInfo) -> Self {
        match hw.platform.render_core_family {
            RenderCoreFamily::Gen12Lp => Self::Interface23,
            RenderCoreFamily::Gen9 | RenderCoreFamily::Gen11 => Self::Interface20,
        }
    }

    #[must_use]
    pub const fn uses_hw_queue(self) -> bool {
        matches!(self, Self::Interface23)
    }
}

const fn node_ordinal(engine: EngineType) -> u32 {
    match engine {
        EngineType::Rcs => 0,
        EngineType::Bcs => 1,
        EngineType::Ccs => 2,
    }
}

/// A RAII wrapper around a driver context and the queue that feeds its engine.
///
/// Dropping it destroys the monitor fence (the hardware queue on `Interface23`, the standalone
/// sync object on `Interface20`) and then the context.
#[derive(Debug)]
pub struct EngineQueue {
    driver: Arc<KmtDriver>,
    context: KmtHandle,
    interface: QueueInterface,
    engine: EngineType,
    hw_queue: KmtHandle,
    monitor: KmtHandle,
    fence: MonitoredFence,
}

impl EngineQueue {
    /// Submits `command` and returns the fence value that marks its completion.
    ///
    /// # Errors
    /// The driver's error for this interface's submit call.
    pub fn submit(&self, command: CommandBuffer) -> KmtResult<u64> {
        match self.interface {
            QueueInterface::Interface23 => self.driver.submit_command_to_hw_queue(self.hw_queue, command),
            QueueInterface::Interface20 => self.driver.submit_command(self.context, self.monitor, command),
        }
    }

    /// Polls the monitor fence until it reaches `value`.
    #[must_use]
    pub fn wait(&self, value: u64, timeout: Duration) -> bool {
        self.fence.wait(value, timeout)
    }

    /// Retires everything submitted so far. Needed only with deferred completion.
    ///
    /// # Errors
    /// The driver's error if the queue's handles are gone.
    pub fn complete(&self) -> KmtResult<u64> {
        match self.interface {
            QueueInterface::Interface23 => self.driver.complete_hw_queue_submissions(self.hw_queue),
            QueueInterface::Interface20 => self.driver.complete_sync_object(self.monitor),
        }
    }

    #[must_use]
    pub const fn fence(&self) -> &MonitoredFence {
        &self.fence
    }

    #[must_use]
    pub const fn interface(&self) -> QueueInterface {
        self.interface
    }

    #[must_use]
    pub const fn engine(&self) -> EngineType {
        self.engine
    }

    #[must_use]
    pub const fn context(&self) -> KmtHandle {
        self.context
    }

    /// The hardware queue handle; `NULL` on `Interface20`.
    #[must_use]
    pub const fn hw_queue(&self) -> KmtHandle {
        self.hw_queue
    }

    #[must_use]
    pub const fn monitor(&self) -> KmtHandle {
        self.monitor
    }

    fn destroy_monitor_fence(&self) -> KmtResult<()> {
        match self.interface {
            QueueInterface::Interface23 => self.driver.destroy_hw_queue(self.hw_queue),
            QueueInterface::Interface20 => self.driver.destroy_synchronization_object(self.monitor),
        }
    }
}

impl Drop for EngineQueue {
    fn drop(&mut self) {
        let monitor = if self.interface.uses_hw_queue() {
            self.hw_queue
        } else {
            self.monitor
        };
        warn_on_teardown("monitor fence", monitor, self.destroy_monitor_fence());
        warn_on_teardown("context", self.context, self.driver.destroy_context(self.context));
    }
}

pub struct QueueBuilder {
    driver: Arc<KmtDriver>,
    device: KmtHandle,

    // Inputs
    interface: QueueInterface,
    engine: EngineType,
    engine_affinity: u32,
    private_driver_data: Option<Vec<u8>>,
}

impl QueueBuilder {
    /// Starts from the interface and default engine the driver's hardware calls for.
    #[must_use]
    pub fn new(driver: Arc<KmtDriver>, device: KmtHandle) -> Self {
        let mut hw = *driver.hardware_info();
        hw.adjust_default_engine_type();
        Self {
            interface: QueueInterface::for_hardware(&hw),
            engine: hw.capability_table.default_engine_type,
            engine_affinity: 0,
            private_driver_data: None,
            driver,
            device,
        }
    }

    #[must_use]
    pub const fn with_interface(mut self, interface: QueueInterface) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub const fn with_engine(mut self, engine: EngineType) -> Self {
        self.engine = engine;
        self
    }

    #[must_use]
    pub const fn with_engine_affinity(mut self, affinity: u32) -> Self {
        self.engine_affinity = affinity;
        self
    }

    #[must_use]
    pub fn with_private_driver_data(mut self, data: Vec<u8>) -> Self {
        self.private_driver_data = Some(data);
        self
    }

    /// Creates the context and its monitor fence.
    ///
    /// # Errors
    /// The driver's error; a context created before the failure is destroyed again.
    pub fn create(self) -> KmtResult<EngineQueue> {
        let private_driver_data_size = self
            .private_driver_data
            .as_ref()
            .map_or(0, |d| u32::try_from(d.len()).unwrap_or(u32::MAX));
        let context = self.driver.create_context(&CreateContextArgs {
            device: self.device,
            node_ordinal: node_ordinal(self.engine),
            engine_affinity: self.engine_affinity,
            private_driver_data: self.private_driver_data,
            private_driver_data_size,
        })?;

        let monitor = match self.interface {
            QueueInterface::Interface23 => self
                .driver
                .create_hw_queue(context)
                .map(|info| (info.handle, info.progress_fence)),
            QueueInterface::Interface20 => self
                .driver
                .create_synchronization_object(self.device)
                .map(|info| (KmtHandle::NULL, info.handle)),
        }
        .and_then(|(hw_queue, monitor)| {
            let fence = self.driver.monitored_fence(monitor)?;
            Ok((hw_queue, monitor, fence))
        });

        let (hw_queue, monitor, fence) = match monitor {
            Ok(created) => created,
            Err(e) => {
                warn_on_teardown("context", context, self.driver.destroy_context(context));
                return Err(e);
            }
        };

        debug!(%context, interface = ?self.interface, engine = ?self.engine, %monitor, "Engine queue created");
        Ok(EngineQueue {
            driver: self.driver,
            context,
            interface: self.interface,
            engine: self.engine,
            hw_queue,
            monitor,
            fence,
        })
    }
}
