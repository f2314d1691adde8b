//! Kernel capability transport
//!
//! The subset of microkernel system calls the runtime relies on. A real
//! system binds these to the kernel's invocation ABI; tests use
//! [`crate::testing::MockKernel`].

use alloc::sync::Arc;

use crate::error::SrvResult;
use crate::rpc::Message;
use crate::types::{Badge, CPtr};

/// Capability operations on the caller's own capability space
pub trait Kernel {
    /// Mint a badged copy of the capability in `src` into the empty slot `dest`
    fn mint(&self, dest: CPtr, src: CPtr, badge: Badge) -> SrvResult<()>;

    /// Revoke every capability derived from the one in `slot`
    fn revoke(&self, slot: CPtr) -> SrvResult<()>;

    /// Delete the capability in `slot`, leaving it empty
    fn delete(&self, slot: CPtr) -> SrvResult<()>;

    /// Move the `index`th capability received with the last message into `dest`
    fn copyout(&self, dest: CPtr, index: usize) -> SrvResult<()>;

    /// Bind the asynchronous endpoint in `async_ep` to the calling thread
    fn bind_notification(&self, async_ep: CPtr) -> SrvResult<()>;

    /// Block on `endpoint` until a message arrives
    fn recv(&self, endpoint: CPtr) -> SrvResult<Message>;

    /// Reply to the sender of the last received message
    fn reply(&self, msg: Message) -> SrvResult<()>;
}

impl<K: Kernel + ?Sized> Kernel for Arc<K> {
    fn mint(&self, dest: CPtr, src: CPtr, badge: Badge) -> SrvResult<()> {
        (**self).mint(dest, src, badge)
    }

    fn revoke(&self, slot: CPtr) -> SrvResult<()> {
        (**self).revoke(slot)
    }

    fn delete(&self, slot: CPtr) -> SrvResult<()> {
        (**self).delete(slot)
    }

    fn copyout(&self, dest: CPtr, index: usize) -> SrvResult<()> {
        (**self).copyout(dest, index)
    }

    fn bind_notification(&self, async_ep: CPtr) -> SrvResult<()> {
        (**self).bind_notification(async_ep)
    }

    fn recv(&self, endpoint: CPtr) -> SrvResult<Message> {
        (**self).recv(endpoint)
    }

    fn reply(&self, msg: Message) -> SrvResult<()> {
        (**self).reply(msg)
    }
}
