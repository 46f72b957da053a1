use crate::error::{KmtError, KmtResult};
use crate::gmm::cache_policy::{CachePolicyTable, ResourceUsage};
use crate::gmm::hw_info::HardwareInfo;
use crate::gmm::page_table::{PageTableManager, TranslationTableCallbacks, TranslationTableFlags};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Memory-management library that hands out client-context handles.
pub trait GmmLibrary: Send + Sync {
    /// Returns a nonzero handle, or `None` if the library cannot serve this hardware.
    fn create_client_context(&self, hw_info: &HardwareInfo) -> Option<u64>;

    fn destroy_client_context(&self, handle: u64);
}

/// In-process library. Hands out sequential handles and tracks how many are live.
#[derive(Debug)]
pub struct BuiltinGmmLibrary {
    next_handle: AtomicU64,
    live: AtomicU64,
}

impl Default for BuiltinGmmLibrary {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            live: AtomicU64::new(0),
        }
    }
}

impl BuiltinGmmLibrary {
    #[must_use]
    pub fn live_contexts(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }
}

impl GmmLibrary for BuiltinGmmLibrary {
    fn create_client_context(&self, _hw_info: &HardwareInfo) -> Option<u64> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn destroy_client_context(&self, handle: u64) {
        if handle != 0 {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Per-device binding to the memory-management library.
pub struct ClientContext {
    handle: u64,
    hw_info: HardwareInfo,
    cache_policy: CachePolicyTable,
    library: Arc<dyn GmmLibrary>,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("handle", &self.handle)
            .field("platform", &self.hw_info.platform)
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    /// # Errors
    /// `Fatal` when the library returns no handle; the device cannot be brought up without one.
    pub fn new(hw_info: HardwareInfo, library: Arc<dyn GmmLibrary>) -> KmtResult<Arc<Self>> {
        let handle = match library.create_client_context(&hw_info) {
            Some(handle) if handle != 0 => handle,
            _ => {
                error!(platform = ?hw_info.platform, "Memory-management library returned no client context");
                return Err(KmtError::Fatal(
                    "memory-management library returned no client context".into(),
                ));
            }
        };

        debug!(handle, "Client context created");
        Ok(Arc::new(Self {
            handle,
            cache_policy: CachePolicyTable::for_family(hw_info.platform.render_core_family),
            hw_info,
            library,
        }))
    }

    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    #[must_use]
    pub const fn hardware_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    /// MOCS value for a usage class.
    #[must_use]
    pub const fn cache_policy_class(&self, usage: ResourceUsage) -> u32 {
        self.cache_policy.memory_object(usage).dword_value()
    }

    #[must_use]
    pub fn create_page_table_manager(
        &self,
        flags: TranslationTableFlags,
        callbacks: Arc<dyn TranslationTableCallbacks>,
        root_va: u64,
    ) -> PageTableManager {
        if !self.hw_info.feature_table.ftr_aux_translation_table {
            warn!("Creating aux table manager on hardware without aux translation");
        }
        PageTableManager::new(self.handle, flags, callbacks, root_va)
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.library.destroy_client_context(self.handle);
        debug!(handle = self.handle, "Client context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingLibrary;

    impl GmmLibrary for RefusingLibrary {
        fn create_client_context(&self, _hw_info: &HardwareInfo) -> Option<u64> {
            None
        }

        fn destroy_client_context(&self, _handle: u64) {}
    }

    #[test]
    fn missing_library_handle_is_fatal() {
        let err = ClientContext::new(HardwareInfo::tigerlake(), Arc::new(RefusingLibrary)).unwrap_err();
        assert!(matches!(err, KmtError::Fatal(_)));
    }

    #[test]
    fn handle_is_released_on_drop() {
        let library = Arc::new(BuiltinGmmLibrary::default());
        let ctx = ClientContext::new(HardwareInfo::tigerlake(), library.clone()).unwrap();
        assert_ne!(ctx.handle(), 0);
        assert_eq!(library.live_contexts(), 1);
        drop(ctx);
        assert_eq!(library.live_contexts(), 0);
    }

    #[test]
    fn cache_policy_class_matches_family_table() {
        let library = Arc::new(BuiltinGmmLibrary::default());
        let ctx = ClientContext::new(HardwareInfo::skylake(), library).unwrap();
        let table = CachePolicyTable::for_family(ctx.hardware_info().platform.render_core_family);
        for usage in ResourceUsage::ALL {
            assert_eq!(
                ctx.cache_policy_class(usage),
                table.memory_object(usage).dword_value()
            );
        }
    }
}
