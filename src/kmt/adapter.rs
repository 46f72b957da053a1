//! Adapter-info descriptor and GPU VA partition layout reported by the driver.

use crate::gmm::hw_info::{HardwareInfo, Platform, SystemInfo};
use crate::utils::{GB, MAX_SVM_ADDRESS, PAGE_SIZE_64K, align_down};
use serde::{Deserialize, Serialize};

pub const CACHE_LINE_SIZE: u32 = 64;
pub const MIN_RENDER_FREQ_MHZ: u32 = 350;
pub const MAX_RENDER_FREQ_MHZ: u32 = 1150;
pub const DMA_BUFFER_SIZE: u32 = 32768;
pub const GFX_MEMORY_SIZE: u64 = 2_181_038_080;
pub const SYSTEM_SHARED_MEMORY: u64 = 4_249_540_608;

pub const HEAP32_COUNT: usize = 4;

/// An inclusive `[base, limit]` range of GPU virtual addresses. Empty when `limit < base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapRange {
    pub base: u64,
    pub limit: u64,
}

impl Default for HeapRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl HeapRange {
    pub const EMPTY: Self = Self { base: 1, limit: 0 };

    #[must_use]
    pub const fn new(base: u64, limit: u64) -> Self {
        Self { base, limit }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.limit < self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.limit - self.base + 1
        }
    }

    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        !self.is_empty() && address >= self.base && address <= self.limit
    }
}

/// Split of the GPU virtual address space into heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GfxPartition {
    pub standard: HeapRange,
    pub standard64kb: HeapRange,
    pub svm: HeapRange,
    pub heap32: [HeapRange; HEAP32_COUNT],
}

impl GfxPartition {
    /// Lays out the partition for an address space of `gpu_address_space` bytes.
    ///
    /// A full-range (48-bit) space shares its low 47 bits with the CPU as SVM and places the
    /// GPU-only heaps above it. Smaller spaces have no SVM heap and start at the 64 KiB origin.
    #[must_use]
    pub fn for_address_space(gpu_address_space: u64) -> Self {
        let gpu_address_space = gpu_address_space.max(4 * GB);
        let top = gpu_address_space - 1;

        let (svm, gfx_base) = if gpu_address_space > MAX_SVM_ADDRESS + 1 {
            (HeapRange::new(0, MAX_SVM_ADDRESS), MAX_SVM_ADDRESS + 1)
        } else {
            (HeapRange::EMPTY, PAGE_SIZE_64K)
        };

        let gfx_size = top - gfx_base + 1;
        let heap_size = (4 * GB).min(align_down(gfx_size / 8, PAGE_SIZE_64K));

        let mut heap32 = [HeapRange::EMPTY; HEAP32_COUNT];
        for (i, heap) in heap32.iter_mut().enumerate() {
            let base = gfx_base + i as u64 * heap_size;
            *heap = HeapRange::new(base, base + heap_size - 1);
        }

        let rest_base = gfx_base + HEAP32_COUNT as u64 * heap_size;
        let half = align_down((top - rest_base + 1) / 2, PAGE_SIZE_64K);

        Self {
            standard: HeapRange::new(rest_base, rest_base + half - 1),
            standard64kb: HeapRange::new(rest_base + half, top),
            svm,
            heap32,
        }
    }
}

/// Fixed-size descriptor returned by the adapter-info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub platform: Platform,
    pub system_info: SystemInfo,
    pub cache_line_size: u32,
    pub min_render_freq: u32,
    pub max_render_freq: u32,
    pub size_of_dma_buffer: u32,
    pub gfx_memory_size: u64,
    pub system_shared_memory: u64,
    pub system_video_memory: u64,
    pub gpu_address_space: u64,
    pub gfx_partition: GfxPartition,
}

impl AdapterInfo {
    #[must_use]
    pub fn from_hardware_info(hw: &HardwareInfo) -> Self {
        let gpu_address_space = hw.gpu_address_space();
        Self {
            platform: hw.platform,
            system_info: hw.system_info,
            cache_line_size: CACHE_LINE_SIZE,
            min_render_freq: MIN_RENDER_FREQ_MHZ,
            max_render_freq: MAX_RENDER_FREQ_MHZ,
            size_of_dma_buffer: DMA_BUFFER_SIZE,
            gfx_memory_size: GFX_MEMORY_SIZE,
            system_shared_memory: SYSTEM_SHARED_MEMORY,
            system_video_memory: 0,
            gpu_address_space,
            gfx_partition: GfxPartition::for_address_space(gpu_address_space),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmm::hw_info::GPU_ADDRESS_SPACE_48BIT;

    fn assert_disjoint(ranges: &[HeapRange]) {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.limit < b.base || b.limit < a.base, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn full_range_partition_has_svm_below_gpu_heaps() {
        let p = GfxPartition::for_address_space(GPU_ADDRESS_SPACE_48BIT);
        assert_eq!(p.svm, HeapRange::new(0, MAX_SVM_ADDRESS));
        assert_eq!(p.heap32[0].base, MAX_SVM_ADDRESS + 1);
        assert_eq!(p.heap32[0].size(), 4 * GB);
        assert_eq!(p.standard64kb.limit, GPU_ADDRESS_SPACE_48BIT - 1);

        let mut all = vec![p.svm, p.standard, p.standard64kb];
        all.extend(p.heap32);
        assert_disjoint(&all);
    }

    #[test]
    fn limited_range_partition_has_no_svm() {
        let p = GfxPartition::for_address_space(1 << 36);
        assert!(p.svm.is_empty());
        assert_eq!(p.heap32[0].base, PAGE_SIZE_64K);
        assert_eq!(p.standard64kb.limit, (1 << 36) - 1);

        let mut all = vec![p.standard, p.standard64kb];
        all.extend(p.heap32);
        assert_disjoint(&all);
        assert!(all.iter().all(|r| !r.is_empty()));
    }

    #[test]
    fn adapter_info_carries_fixed_descriptor_values() {
        let info = AdapterInfo::from_hardware_info(&HardwareInfo::tigerlake());
        assert_eq!(info.cache_line_size, 64);
        assert_eq!(info.min_render_freq, 350);
        assert_eq!(info.max_render_freq, 1150);
        assert_eq!(info.size_of_dma_buffer, 32768);
        assert_eq!(info.gfx_memory_size, 2_181_038_080);
        assert_eq!(info.gpu_address_space, GPU_ADDRESS_SPACE_48BIT);
    }
}
