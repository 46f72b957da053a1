//! User-mode side of a GPU kernel driver interface: handle-based adapters and devices, GPU
//! virtual address mapping with paging fences, residency, hardware queue submission and the
//! auxiliary translation table.

pub mod config;
pub mod error;
pub mod gmm;
pub mod kmt;
pub mod thunk;
pub mod utils;

pub use config::Config;
pub use error::{KmtError, KmtResult};
pub use kmt::{CompletionMode, KmtDriver, KmtHandle, MonitoredFence, ObjectKind};
pub use thunk::DeviceSession;
