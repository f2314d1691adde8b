//! Process server contract
//!
//! The process server is the supervisor that creates endpoints, hands out
//! anonymous memory, and watches clients for death. A server registers a
//! notification buffer with it; fault, content-init and death notices are
//! written there (see [`crate::share::notify`]) and signalled on the
//! server's asynchronous endpoint.

use alloc::sync::Arc;

use crate::error::SrvResult;
use crate::share::SharedRegion;
use crate::types::{CPtr, DeathId};

/// Calls a server makes on the process server
pub trait ProcServ {
    /// Create a synchronous endpoint in the empty slot `dest`
    fn new_endpoint(&self, dest: CPtr) -> SrvResult<()>;

    /// Create an asynchronous endpoint in the empty slot `dest`
    fn new_async_endpoint(&self, dest: CPtr) -> SrvResult<()>;

    /// Watch the client named by `liveness`; its death is reported on the
    /// notification ring and signalled through `notify_ep`
    fn watch_client(&self, liveness: CPtr, notify_ep: CPtr) -> SrvResult<DeathId>;

    /// Stop watching the client named by `liveness`
    fn unwatch_client(&self, liveness: CPtr) -> SrvResult<()>;

    /// Open an anonymous dataspace of `size` bytes, placing its capability in
    /// `dest`, and map it into the caller
    fn open_anon(&self, size: usize, dest: CPtr) -> SrvResult<SharedRegion>;

    /// Use `dataspace` as the caller's notification buffer
    fn set_notification_buffer(&self, dataspace: CPtr) -> SrvResult<()>;

    /// Use `dataspace` as the caller's parameter buffer to the process server
    fn set_param_buffer(&self, dataspace: CPtr, size: usize) -> SrvResult<()>;
}

impl<P: ProcServ + ?Sized> ProcServ for Arc<P> {
    fn new_endpoint(&self, dest: CPtr) -> SrvResult<()> {
        (**self).new_endpoint(dest)
    }

    fn new_async_endpoint(&self, dest: CPtr) -> SrvResult<()> {
        (**self).new_async_endpoint(dest)
    }

    fn watch_client(&self, liveness: CPtr, notify_ep: CPtr) -> SrvResult<DeathId> {
        (**self).watch_client(liveness, notify_ep)
    }

    fn unwatch_client(&self, liveness: CPtr) -> SrvResult<()> {
        (**self).unwatch_client(liveness)
    }

    fn open_anon(&self, size: usize, dest: CPtr) -> SrvResult<SharedRegion> {
        (**self).open_anon(size, dest)
    }

    fn set_notification_buffer(&self, dataspace: CPtr) -> SrvResult<()> {
        (**self).set_notification_buffer(dataspace)
    }

    fn set_param_buffer(&self, dataspace: CPtr, size: usize) -> SrvResult<()> {
        (**self).set_param_buffer(dataspace, size)
    }
}
