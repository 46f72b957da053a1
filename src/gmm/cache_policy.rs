use crate::gmm::hw_info::RenderCoreFamily;
use serde::{Deserialize, Serialize};

/// How a surface is used; selects its memory-object control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceUsage {
    Unknown,
    OclBuffer,
    OclBufferConst,
    OclBufferCachelineMisaligned,
    OclImage,
    OclStateHeapBuffer,
    OclSystemMemoryBuffer,
    OclSystemMemoryBufferCachelineMisaligned,
    OclInlineConstHdc,
    PagetableManager,
}

impl ResourceUsage {
    pub const ALL: [Self; 10] = [
        Self::Unknown,
        Self::OclBuffer,
        Self::OclBufferConst,
        Self::OclBufferCachelineMisaligned,
        Self::OclImage,
        Self::OclStateHeapBuffer,
        Self::OclSystemMemoryBuffer,
        Self::OclSystemMemoryBufferCachelineMisaligned,
        Self::OclInlineConstHdc,
        Self::PagetableManager,
    ];
}

/// Memory object control state: a MOCS table index, pre-shifted into register position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemoryObjectControlState(pub u32);

impl MemoryObjectControlState {
    const fn from_index(index: u32) -> Self {
        Self(index << 1)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 >> 1
    }

    #[must_use]
    pub const fn dword_value(self) -> u32 {
        self.0
    }
}

/// MOCS indices per usage, one row per render-core family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicyTable {
    /// Uncached.
    uncached: u32,
    /// LLC and L3 write-back.
    cached: u32,
    /// L3 off, LLC on. Used when a buffer is not cacheline aligned.
    llc_only: u32,
}

impl CachePolicyTable {
    #[must_use]
    pub const fn for_family(family: RenderCoreFamily) -> Self {
        match family {
            RenderCoreFamily::Gen9 | RenderCoreFamily::Gen11 => Self {
                uncached: 0,
                cached: 2,
                llc_only: 1,
            },
            RenderCoreFamily::Gen12Lp => Self {
                uncached: 3,
                cached: 2,
                llc_only: 5,
            },
        }
    }

    #[must_use]
    pub const fn memory_object(&self, usage: ResourceUsage) -> MemoryObjectControlState {
        let index = match usage {
            ResourceUsage::Unknown
            | ResourceUsage::OclBufferCachelineMisaligned
            | ResourceUsage::OclSystemMemoryBufferCachelineMisaligned => self.llc_only,
            ResourceUsage::OclBuffer
            | ResourceUsage::OclBufferConst
            | ResourceUsage::OclImage
            | ResourceUsage::OclSystemMemoryBuffer
            | ResourceUsage::OclInlineConstHdc => self.cached,
            ResourceUsage::OclStateHeapBuffer | ResourceUsage::PagetableManager => self.uncached,
        };
        MemoryObjectControlState::from_index(index)
    }
}
