//! Auxiliary translation table: per-VA compression metadata for compressed surfaces.
//!
//! The table is only usable once it has been registered with a command stream receiver and
//! its root address written to the engine's aux-table register.

use crate::error::{KmtError, KmtResult};
use crate::gmm::hw_info::EngineType;
use crate::kmt::handle::KmtHandle;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const RCS_AUX_TABLE_BASE_REGISTER: u32 = 0x4200;
const CCS_AUX_TABLE_BASE_REGISTER: u32 = 0x42c0;
const BCS_AUX_TABLE_BASE_REGISTER: u32 = 0x4230;

const fn aux_table_register(engine: EngineType) -> u32 {
    match engine {
        EngineType::Rcs => RCS_AUX_TABLE_BASE_REGISTER,
        EngineType::Ccs => CCS_AUX_TABLE_BASE_REGISTER,
        EngineType::Bcs => BCS_AUX_TABLE_BASE_REGISTER,
    }
}

/// Identity of the command stream receiver that owns register writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsrHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TranslationTableFlags {
    pub aux_table: bool,
    pub tr_table: bool,
}

impl TranslationTableFlags {
    pub const AUX: Self = Self {
        aux_table: true,
        tr_table: false,
    };
}

/// Hooks the table manager uses to reach the command stream.
pub trait TranslationTableCallbacks: Send + Sync {
    /// Emits a register load of `address` into `register_offset` on the given CSR.
    ///
    /// # Errors
    /// Any error aborts registration; the manager stays uninitialized for that engine.
    fn write_l3_address(&self, csr: CsrHandle, address: u64, register_offset: u32) -> KmtResult<()>;
}

/// A surface whose compression metadata is tracked by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxSurface {
    pub allocation: KmtHandle,
    pub size: u64,
    /// Whether the surface carries aux (compression) data at all.
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxEntry {
    pub allocation: KmtHandle,
    pub size: u64,
}

impl AuxEntry {
    const fn end(&self, gpu_va: u64) -> u64 {
        gpu_va.saturating_add(self.size)
    }
}

pub struct PageTableManager {
    client_handle: u64,
    flags: TranslationTableFlags,
    callbacks: Arc<dyn TranslationTableCallbacks>,
    root_va: u64,
    csr: Option<CsrHandle>,
    registered_engines: HashSet<EngineType>,
    initialized: bool,
    entries: BTreeMap<u64, AuxEntry>,
}

impl fmt::Debug for PageTableManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableManager")
            .field("client_handle", &self.client_handle)
            .field("flags", &self.flags)
            .field("root_va", &format_args!("0x{:x}", self.root_va))
            .field("csr", &self.csr)
            .field("initialized", &self.initialized)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl PageTableManager {
    pub(crate) fn new(
        client_handle: u64,
        flags: TranslationTableFlags,
        callbacks: Arc<dyn TranslationTableCallbacks>,
        root_va: u64,
    ) -> Self {
        Self {
            client_handle,
            flags,
            callbacks,
            root_va,
            csr: None,
            registered_engines: HashSet::new(),
            initialized: false,
            entries: BTreeMap::new(),
        }
    }

    /// Binds the manager to a command stream receiver. Allowed once.
    ///
    /// # Errors
    /// `Usage` if a CSR handle is already set.
    pub fn set_csr_handle(&mut self, csr: CsrHandle) -> KmtResult<()> {
        if let Some(existing) = self.csr {
            return Err(KmtError::Usage(format!(
                "CSR handle already set to 0x{:x}",
                existing.0
            )));
        }
        self.csr = Some(csr);
        Ok(())
    }

    /// Writes the aux-table root into `engine`'s register. Repeated calls for an engine that is
    /// already registered do nothing.
    ///
    /// # Errors
    /// `Usage` without a CSR handle; otherwise whatever the register-write callback returns.
    pub fn init_context_aux_table_register(
        &mut self,
        initial_batch_buffer: KmtHandle,
        engine: EngineType,
    ) -> KmtResult<()> {
        let Some(csr) = self.csr else {
            return Err(KmtError::Usage(
                "aux table registration requires a CSR handle".into(),
            ));
        };
        if self.registered_engines.contains(&engine) {
            return Ok(());
        }

        self.callbacks
            .write_l3_address(csr, self.root_va, aux_table_register(engine))?;
        self.registered_engines.insert(engine);
        self.initialized = true;

        info!(?engine, %initial_batch_buffer, root_va = self.root_va, "Aux table registered");
        Ok(())
    }

    /// Maps or unmaps the aux entry for `surface` at `gpu_va`.
    ///
    /// # Errors
    /// * `Usage` before registration.
    /// * `InvalidParameter` for a surface without aux data or with a zero size, and when the
    ///   range overlaps an entry of another allocation.
    pub fn update_aux_table(&mut self, gpu_va: u64, surface: &AuxSurface, map: bool) -> KmtResult<()> {
        if !self.initialized {
            return Err(KmtError::Usage("aux table is not registered".into()));
        }
        if !surface.compressed {
            return Err(KmtError::InvalidParameter(format!(
                "allocation {} has no aux data",
                surface.allocation
            )));
        }
        if surface.size == 0 {
            return Err(KmtError::InvalidParameter(format!(
                "allocation {} has an empty aux range",
                surface.allocation
            )));
        }

        if !map {
            if let Some(entry) = self.entries.get(&gpu_va)
                && entry.allocation == surface.allocation
            {
                self.entries.remove(&gpu_va);
                debug!(gpu_va, allocation = %surface.allocation, "Aux entry removed");
            }
            return Ok(());
        }

        let entry = AuxEntry {
            allocation: surface.allocation,
            size: surface.size,
        };
        if self.entries.get(&gpu_va) == Some(&entry) {
            return Ok(());
        }

        let end = entry.end(gpu_va);
        let mut replaced = Vec::new();
        for (&va, existing) in self.entries.range(..end).rev() {
            if existing.end(va) <= gpu_va {
                break;
            }
            if existing.allocation != surface.allocation {
                return Err(KmtError::InvalidParameter(format!(
                    "aux range 0x{gpu_va:x}+0x{:x} overlaps allocation {} at 0x{va:x}",
                    surface.size, existing.allocation
                )));
            }
            replaced.push(va);
        }
        for va in replaced {
            self.entries.remove(&va);
        }

        self.entries.insert(gpu_va, entry);
        debug!(gpu_va, size = surface.size, allocation = %surface.allocation, "Aux entry mapped");
        Ok(())
    }

    #[must_use]
    pub fn entry(&self, gpu_va: u64) -> Option<AuxEntry> {
        self.entries.get(&gpu_va).copied()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn flags(&self) -> TranslationTableFlags {
        self.flags
    }

    #[must_use]
    pub const fn root_va(&self) -> u64 {
        self.root_va
    }

    #[must_use]
    pub fn is_engine_registered(&self, engine: EngineType) -> bool {
        self.registered_engines.contains(&engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        writes: Mutex<Vec<(CsrHandle, u64, u32)>>,
    }

    impl TranslationTableCallbacks for RecordingCallbacks {
        fn write_l3_address(&self, csr: CsrHandle, address: u64, register_offset: u32) -> KmtResult<()> {
            self.writes.lock().unwrap().push((csr, address, register_offset));
            Ok(())
        }
    }

    fn manager() -> (PageTableManager, Arc<RecordingCallbacks>) {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mgr = PageTableManager::new(1, TranslationTableFlags::AUX, callbacks.clone(), 0x20_0000);
        (mgr, callbacks)
    }

    fn surface(raw: u32, size: u64) -> AuxSurface {
        AuxSurface {
            allocation: KmtHandle::from_raw(raw),
            size,
            compressed: true,
        }
    }

    fn registered() -> PageTableManager {
        let (mut mgr, _) = manager();
        mgr.set_csr_handle(CsrHandle(0xc5)).unwrap();
        mgr.init_context_aux_table_register(KmtHandle::NULL, EngineType::Rcs)
            .unwrap();
        mgr
    }

    #[test]
    fn csr_handle_is_set_once() {
        let (mut mgr, _) = manager();
        mgr.set_csr_handle(CsrHandle(1)).unwrap();
        assert!(matches!(mgr.set_csr_handle(CsrHandle(2)), Err(KmtError::Usage(_))));
    }

    #[test]
    fn registration_requires_csr() {
        let (mut mgr, callbacks) = manager();
        let err = mgr
            .init_context_aux_table_register(KmtHandle::NULL, EngineType::Rcs)
            .unwrap_err();
        assert!(matches!(err, KmtError::Usage(_)));
        assert!(!mgr.is_initialized());
        assert!(callbacks.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn registration_writes_root_once_per_engine() {
        let (mut mgr, callbacks) = manager();
        mgr.set_csr_handle(CsrHandle(7)).unwrap();
        mgr.init_context_aux_table_register(KmtHandle::NULL, EngineType::Ccs)
            .unwrap();
        mgr.init_context_aux_table_register(KmtHandle::NULL, EngineType::Ccs)
            .unwrap();
        assert!(mgr.is_initialized());

        let writes = callbacks.writes.lock().unwrap();
        assert_eq!(*writes, vec![(CsrHandle(7), 0x20_0000, CCS_AUX_TABLE_BASE_REGISTER)]);
    }

    #[test]
    fn update_before_registration_is_usage_error() {
        let (mut mgr, _) = manager();
        let err = mgr.update_aux_table(0x1_0000, &surface(1, 0x1000), true).unwrap_err();
        assert!(matches!(err, KmtError::Usage(_)));
    }

    #[test]
    fn uncompressed_surface_is_rejected() {
        let mut mgr = registered();
        let mut s = surface(1, 0x1000);
        s.compressed = false;
        assert!(mgr.update_aux_table(0x1_0000, &s, true).unwrap_err().is_invalid_parameter());
    }

    #[test]
    fn repeated_map_and_unmap_are_idempotent() {
        let mut mgr = registered();
        let s = surface(1, 0x1_0000);
        mgr.update_aux_table(0x10_0000, &s, true).unwrap();
        mgr.update_aux_table(0x10_0000, &s, true).unwrap();
        assert_eq!(mgr.entry_count(), 1);

        mgr.update_aux_table(0x10_0000, &s, false).unwrap();
        mgr.update_aux_table(0x10_0000, &s, false).unwrap();
        assert_eq!(mgr.entry_count(), 0);
    }

    #[test]
    fn overlap_with_other_allocation_fails() {
        let mut mgr = registered();
        mgr.update_aux_table(0x10_0000, &surface(1, 0x2_0000), true).unwrap();
        let err = mgr
            .update_aux_table(0x11_0000, &surface(2, 0x1_0000), true)
            .unwrap_err();
        assert!(err.is_invalid_parameter());
        assert!(!err.is_retryable());
        assert_eq!(mgr.entry(0x10_0000).map(|e| e.allocation), Some(KmtHandle::from_raw(1)));
        assert!(mgr.entry(0x11_0000).is_none());

        mgr.update_aux_table(0x12_0000, &surface(2, 0x1_0000), true).unwrap();
        assert_eq!(mgr.entry_count(), 2);
    }

    #[test]
    fn remapping_same_allocation_replaces_entry() {
        let mut mgr = registered();
        mgr.update_aux_table(0x10_0000, &surface(1, 0x1_0000), true).unwrap();
        mgr.update_aux_table(0x10_0000, &surface(1, 0x2_0000), true).unwrap();
        assert_eq!(mgr.entry_count(), 1);
        assert_eq!(mgr.entry(0x10_0000).map(|e| e.size), Some(0x2_0000));
    }

    #[test]
    fn empty_surface_cannot_displace_an_entry() {
        let mut mgr = registered();
        mgr.update_aux_table(0x10_0000, &surface(0x10, 0x1_0000), true).unwrap();
        let err = mgr
            .update_aux_table(0x10_0000, &surface(0x20, 0), true)
            .unwrap_err();
        assert!(err.is_invalid_parameter());
        assert_eq!(
            mgr.entry(0x10_0000),
            Some(AuxEntry {
                allocation: KmtHandle::from_raw(0x10),
                size: 0x1_0000,
            })
        );
    }
}
