use crate::kmt::handle::{KmtHandle, ObjectKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KmtError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {kind} handle: {handle}")]
    InvalidHandle { kind: ObjectKind, handle: KmtHandle },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("GPU VA 0x{address:x} outside allowed range [0x{minimum:x}, 0x{maximum:x}]")]
    OutOfRange {
        address: u64,
        minimum: u64,
        maximum: u64,
    },

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Out of GPU virtual address space")]
    OutOfVirtualAddressSpace,

    #[error("Handle table exhausted")]
    HandleTableFull,

    #[error("Unrecoverable: {0}")]
    Fatal(String),

    #[error("Config Error: {0}")]
    Config(#[from] serde_json::Error),
}

impl KmtError {
    /// True for both malformed parameters and unrecognized handles.
    #[must_use]
    pub const fn is_invalid_parameter(&self) -> bool {
        matches!(self, Self::InvalidParameter(_) | Self::InvalidHandle { .. })
    }

    /// Transient failures the caller may retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationFailed(_))
    }
}

// A convenient alias
pub type KmtResult<T> = Result<T, KmtError>;
