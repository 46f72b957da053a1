pub mod adapter;
pub mod args;
pub mod device;
pub mod fence;
pub mod handle;
pub mod objects;
pub mod paging;
pub mod va;

pub use device::KmtDriver;
pub use fence::{CompletionMode, MonitoredFence};
pub use handle::{KmtHandle, ObjectKind};
