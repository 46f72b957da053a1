pub mod cache_policy;
pub mod client_context;
pub mod hw_info;
pub mod page_table;

pub use client_context::{BuiltinGmmLibrary, ClientContext, GmmLibrary};
pub use hw_info::{EngineType, HardwareInfo};
pub use page_table::PageTableManager;
