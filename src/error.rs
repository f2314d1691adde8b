//! Unified error type for srvkit using thiserror

use thiserror::Error;

/// Errors returned by every srvkit operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrvError {
    /// No free ID, slot, or buffer space
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Unknown ID, name, or death-watch correlation
    #[error("not found")]
    NotFound,

    /// ID is currently free in its pool
    #[error("not allocated")]
    NotAllocated,

    /// Object was already released
    #[error("already freed")]
    AlreadyFreed,

    /// Corrupt ring metadata or notification record
    #[error("malformed data")]
    Malformed,

    /// Request carried the wrong capability shape
    #[error("permission or protocol violation")]
    PermissionOrProtocol,

    /// Caller supplied an argument outside the accepted range
    #[error("invalid argument")]
    InvalidArgument,

    /// Operation not implemented by this server
    #[error("unsupported operation")]
    Unsupported,

    /// Status code reported by the kernel or a collaborating server
    #[error("kernel error {0}")]
    Kernel(i32),
}

/// Result type for srvkit operations
pub type SrvResult<T> = Result<T, SrvError>;

// ============================================================================
// Wire error codes
// ============================================================================

/// Success
pub const ESUCCESS: isize = 0;
/// Out of memory / resources
pub const ENOMEM: isize = -1;
/// Bad file / object descriptor
pub const EBADF: isize = -2;
/// Invalid parameter
pub const EINVALIDPARAM: isize = -3;
/// Unknown object or name
pub const EFILENOTFOUND: isize = -4;
/// Malformed message or data
pub const EMALFORMED: isize = -5;
/// Wrong capability shape
pub const EACCESSDENIED: isize = -6;
/// Not implemented
pub const EUNIMPLEMENTED: isize = -7;
/// Object double free
pub const EDOUBLEFREE: isize = -8;
/// Kernel returned an error we did not classify
pub const EDELEGATED: isize = -9;

impl SrvError {
    /// Negative status code placed in reply messages.
    ///
    /// `Kernel` errors all map to `EDELEGATED`; the kernel status travels in
    /// the word after it (see [`crate::rpc::reply_status`]).
    pub fn errno(self) -> isize {
        match self {
            SrvError::ResourceExhausted => ENOMEM,
            SrvError::NotFound => EFILENOTFOUND,
            SrvError::NotAllocated => EBADF,
            SrvError::AlreadyFreed => EDOUBLEFREE,
            SrvError::Malformed => EMALFORMED,
            SrvError::PermissionOrProtocol => EACCESSDENIED,
            SrvError::InvalidArgument => EINVALIDPARAM,
            SrvError::Unsupported => EUNIMPLEMENTED,
            SrvError::Kernel(_) => EDELEGATED,
        }
    }

    /// Decode a status code taken from a reply message.
    ///
    /// Unclassified codes become `Kernel`; codes that do not fit an `i32`
    /// are `Malformed`.
    pub fn from_errno(code: isize) -> SrvResult<()> {
        match code {
            ESUCCESS => Ok(()),
            ENOMEM => Err(SrvError::ResourceExhausted),
            EFILENOTFOUND => Err(SrvError::NotFound),
            EBADF => Err(SrvError::NotAllocated),
            EDOUBLEFREE => Err(SrvError::AlreadyFreed),
            EMALFORMED => Err(SrvError::Malformed),
            EACCESSDENIED => Err(SrvError::PermissionOrProtocol),
            EINVALIDPARAM => Err(SrvError::InvalidArgument),
            EUNIMPLEMENTED => Err(SrvError::Unsupported),
            other => Err(i32::try_from(other).map_or(SrvError::Malformed, SrvError::Kernel)),
        }
    }
}
