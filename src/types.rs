//! Common types used across srvkit
//!
//! Small integer handles shared by every subsystem. They are kept in one
//! place to avoid circular dependencies between the allocators and the
//! runtime.

use core::fmt;

/// Native machine word, the unit of ring metadata and RPC message payloads
pub type Word = usize;

/// Capability pointer: an integer naming a slot in the caller's capability space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CPtr(pub usize);

impl CPtr {
    /// The null capability pointer
    pub const NULL: Self = Self(0);

    /// Raw slot index
    #[inline]
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this names the null slot
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cptr:{:#x}", self.0)
    }
}

/// Badge attached to a minted endpoint capability.
///
/// The kernel delivers the badge with every message sent through the
/// minted handle, so a server can tell which client a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Badge(pub usize);

impl Badge {
    /// Unbadged capability
    pub const NONE: Self = Self(0);

    /// Create a badge from a raw value
    #[inline]
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Raw badge value
    #[inline]
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "badge:{:#x}", self.0)
    }
}

/// Identifier handed out by an object table. Zero is never issued.
pub type ObjId = usize;

/// Client session identifier
pub type ClientId = ObjId;

/// Correlation ID returned by the process server when a client is watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeathId(pub usize);
