pub mod context;
pub mod memory;
pub mod queues;

pub use context::DeviceSession;
