//! Immutable description of the GPU a device is bound to.

use crate::utils::GB;
use serde::{Deserialize, Serialize};

pub const REVISION_A0: u16 = 0;
pub const REVISION_B: u16 = 1;

/// 48-bit GPU virtual address space.
pub const GPU_ADDRESS_SPACE_48BIT: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductFamily {
    Skylake,
    Icelake,
    #[default]
    Tigerlake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderCoreFamily {
    Gen9,
    Gen11,
    #[default]
    Gen12Lp,
}

/// Hardware engine a context or queue feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    /// Render command streamer.
    #[default]
    Rcs,
    /// Compute command streamer.
    Ccs,
    /// Blitter.
    Bcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub product_family: ProductFamily,
    pub render_core_family: RenderCoreFamily,
    pub device_id: u16,
    pub revision_id: u16,
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureTable {
    pub ftr_ccs_node: bool,
    pub ftr_aux_translation_table: bool,
    pub ftr_e2e_compression: bool,
    pub ftr_local_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub eu_count: u32,
    pub thread_count: u32,
    pub slice_count: u32,
    pub subslice_count: u32,
    pub max_eu_per_subslice: u32,
    pub l3_cache_size_kb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityTable {
    pub default_engine_type: EngineType,
    /// Size in bytes of the GPU virtual address space.
    pub gpu_address_space: u64,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            default_engine_type: EngineType::Rcs,
            gpu_address_space: GPU_ADDRESS_SPACE_48BIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareInfo {
    pub platform: Platform,
    pub feature_table: FeatureTable,
    pub system_info: SystemInfo,
    pub capability_table: CapabilityTable,
}

impl Default for HardwareInfo {
    fn default() -> Self {
        Self::tigerlake()
    }
}

impl HardwareInfo {
    /// Gen12LP integrated part (A0 stepping).
    #[must_use]
    pub fn tigerlake() -> Self {
        Self {
            platform: Platform {
                product_family: ProductFamily::Tigerlake,
                render_core_family: RenderCoreFamily::Gen12Lp,
                device_id: 0x9a49,
                revision_id: REVISION_A0,
            },
            feature_table: FeatureTable {
                ftr_ccs_node: true,
                ftr_aux_translation_table: true,
                ftr_e2e_compression: true,
                ftr_local_memory: false,
            },
            system_info: SystemInfo {
                eu_count: 96,
                thread_count: 96 * 7,
                slice_count: 1,
                subslice_count: 6,
                max_eu_per_subslice: 16,
                l3_cache_size_kb: 3840,
            },
            capability_table: CapabilityTable::default(),
        }
    }

    /// Gen9 part with a 48-bit address space and no aux translation.
    #[must_use]
    pub fn skylake() -> Self {
        Self {
            platform: Platform {
                product_family: ProductFamily::Skylake,
                render_core_family: RenderCoreFamily::Gen9,
                device_id: 0x1912,
                revision_id: 0,
            },
            feature_table: FeatureTable::default(),
            system_info: SystemInfo {
                eu_count: 24,
                thread_count: 24 * 7,
                slice_count: 1,
                subslice_count: 3,
                max_eu_per_subslice: 8,
                l3_cache_size_kb: 768,
            },
            capability_table: CapabilityTable::default(),
        }
    }

    #[must_use]
    pub const fn with_revision(mut self, revision_id: u16) -> Self {
        self.platform.revision_id = revision_id;
        self
    }

    #[must_use]
    pub const fn with_gpu_address_space(mut self, size: u64) -> Self {
        self.capability_table.gpu_address_space = size;
        self
    }

    /// Picks the engine general-purpose queues default to.
    ///
    /// Gen12LP parts with a compute node use it from the B stepping on; A0 stays on render.
    pub fn adjust_default_engine_type(&mut self) {
        let engine = match self.platform.render_core_family {
            RenderCoreFamily::Gen12Lp
                if self.feature_table.ftr_ccs_node
                    && self.platform.revision_id >= REVISION_B =>
            {
                EngineType::Ccs
            }
            _ => EngineType::Rcs,
        };
        self.capability_table.default_engine_type = engine;
    }

    #[must_use]
    pub const fn is_full_range_svm(&self) -> bool {
        self.capability_table.gpu_address_space > (1 << 47)
    }

    /// Bytes of GPU address space, at least 4 GiB.
    #[must_use]
    pub const fn gpu_address_space(&self) -> u64 {
        if self.capability_table.gpu_address_space < 4 * GB {
            4 * GB
        } else {
            self.capability_table.gpu_address_space
        }
    }
}
