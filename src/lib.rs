//! srvkit - userland server-construction runtime for a multi-server microkernel OS
//!
//! This crate provides the plumbing every system server needs on top of a
//! capability microkernel: a capability slot allocator, a dense object
//! allocation table, a lock-free shared ring buffer for streaming data and
//! asynchronous notifications, a client session table with deferred deletion,
//! and a server-common runtime that wires them together.
//!
//! The kernel, the process server and the name server are external
//! collaborators reached through the traits in [`kernel`], [`procserv`] and
//! [`nameserv`]. In-memory doubles live in [`testing`].

#![cfg_attr(not(test), no_std)]
// Collaborator traits carry many small integer handles
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod error;
pub mod types;

// Leaf allocators
pub mod cspace;
pub mod oat;
pub mod pool;

// Shared memory
pub mod share;

// Collaborator contracts
pub mod kernel;
pub mod procserv;
pub mod rpc;

// Sessions and servers
pub mod client;
pub mod connect;
pub mod nameserv;
pub mod server;

// In-memory collaborators
pub mod testing;

pub use error::{SrvError, SrvResult};
pub use types::{Badge, CPtr, ClientId, DeathId, ObjId, Word};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "srvkit";
