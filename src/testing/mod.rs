//! In-memory collaborators
//!
//! [`MockKernel`] keeps a map of occupied capability slots, a queue of
//! incoming messages and a log of replies. [`MockProcServ`] creates
//! endpoints and anonymous dataspaces, tracks death watches, and can kill a
//! watched client by writing a death notice into the watcher's notification
//! ring. Both record what was done to them so tests can assert on it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{SrvError, SrvResult};
use crate::kernel::Kernel;
use crate::procserv::ProcServ;
use crate::rpc::Message;
use crate::share::notify::{ContentInitNotice, FaultNotice, Notification, NotificationWriter};
use crate::share::SharedRegion;
use crate::types::{Badge, CPtr, DeathId};

/// Status returned by [`MockKernel::recv`] when no message is queued
pub const MOCK_WOULD_BLOCK: i32 = -11;

/// Status returned by an injected failure
pub const MOCK_INJECTED_FAILURE: i32 = -1;

/// Status returned when minting into an occupied slot
pub const MOCK_SLOT_OCCUPIED: i32 = -2;

// ============================================================================
// Kernel
// ============================================================================

/// What a mock slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockCap {
    /// Kernel object the capability refers to
    pub object: usize,
    pub badge: Badge,
}

#[derive(Debug, Default)]
struct KernelState {
    slots: BTreeMap<CPtr, MockCap>,
    inbox: VecDeque<Message>,
    received_caps: Vec<CPtr>,
    replies: Vec<Message>,
    deleted: Vec<CPtr>,
    revoked: Vec<CPtr>,
    bound: Option<CPtr>,
    fail_mint: bool,
    fail_revoke: bool,
}

/// Kernel double
#[derive(Debug, Default)]
pub struct MockKernel {
    state: Mutex<KernelState>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the next `recv`
    pub fn push_message(&self, msg: Message) {
        self.state.lock().inbox.push_back(msg);
    }

    /// Make `msg`'s capabilities available to `copyout` without `recv`
    pub fn deliver(&self, msg: &Message) {
        self.state.lock().received_caps = msg.caps.clone();
    }

    /// Place a capability in a slot directly
    pub fn insert_cap(&self, slot: CPtr, cap: MockCap) {
        self.state.lock().slots.insert(slot, cap);
    }

    /// Capability held in `slot`
    pub fn cap(&self, slot: CPtr) -> Option<MockCap> {
        self.state.lock().slots.get(&slot).copied()
    }

    /// Badge of the capability in `slot`
    pub fn badge_of(&self, slot: CPtr) -> Option<Badge> {
        self.cap(slot).map(|c| c.badge)
    }

    /// Whether `slot` holds a capability
    pub fn is_occupied(&self, slot: CPtr) -> bool {
        self.state.lock().slots.contains_key(&slot)
    }

    /// Every slot deleted so far, in order
    pub fn deleted(&self) -> Vec<CPtr> {
        self.state.lock().deleted.clone()
    }

    /// Every slot revoked so far, in order
    pub fn revoked(&self) -> Vec<CPtr> {
        self.state.lock().revoked.clone()
    }

    /// Replies sent so far
    pub fn replies(&self) -> Vec<Message> {
        self.state.lock().replies.clone()
    }

    /// Remove and return the most recent reply
    pub fn take_reply(&self) -> Option<Message> {
        self.state.lock().replies.pop()
    }

    /// Asynchronous endpoint bound to the thread
    pub fn bound_notification(&self) -> Option<CPtr> {
        self.state.lock().bound
    }

    /// Make the next `mint` fail
    pub fn fail_next_mint(&self) {
        self.state.lock().fail_mint = true;
    }

    /// Make the next `revoke` fail
    pub fn fail_next_revoke(&self) {
        self.state.lock().fail_revoke = true;
    }
}

impl Kernel for MockKernel {
    fn mint(&self, dest: CPtr, src: CPtr, badge: Badge) -> SrvResult<()> {
        let mut st = self.state.lock();
        if core::mem::take(&mut st.fail_mint) {
            return Err(SrvError::Kernel(MOCK_INJECTED_FAILURE));
        }
        if st.slots.contains_key(&dest) {
            return Err(SrvError::Kernel(MOCK_SLOT_OCCUPIED));
        }
        let object = st.slots.get(&src).map_or(src.0, |c| c.object);
        st.slots.insert(dest, MockCap { object, badge });
        Ok(())
    }

    fn revoke(&self, slot: CPtr) -> SrvResult<()> {
        let mut st = self.state.lock();
        if core::mem::take(&mut st.fail_revoke) {
            return Err(SrvError::Kernel(MOCK_INJECTED_FAILURE));
        }
        st.revoked.push(slot);
        Ok(())
    }

    fn delete(&self, slot: CPtr) -> SrvResult<()> {
        let mut st = self.state.lock();
        st.slots.remove(&slot);
        st.deleted.push(slot);
        Ok(())
    }

    fn copyout(&self, dest: CPtr, index: usize) -> SrvResult<()> {
        let mut st = self.state.lock();
        let src = *st.received_caps.get(index).ok_or(SrvError::Malformed)?;
        if st.slots.contains_key(&dest) {
            return Err(SrvError::Kernel(MOCK_SLOT_OCCUPIED));
        }
        st.slots.insert(
            dest,
            MockCap {
                object: src.0,
                badge: Badge::NONE,
            },
        );
        Ok(())
    }

    fn bind_notification(&self, async_ep: CPtr) -> SrvResult<()> {
        self.state.lock().bound = Some(async_ep);
        Ok(())
    }

    fn recv(&self, _endpoint: CPtr) -> SrvResult<Message> {
        let mut st = self.state.lock();
        let msg = st
            .inbox
            .pop_front()
            .ok_or(SrvError::Kernel(MOCK_WOULD_BLOCK))?;
        st.received_caps = msg.caps.clone();
        Ok(msg)
    }

    fn reply(&self, msg: Message) -> SrvResult<()> {
        self.state.lock().replies.push(msg);
        Ok(())
    }
}

// ============================================================================
// Process server
// ============================================================================

/// A registered death watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockWatch {
    pub liveness: CPtr,
    pub notify_ep: CPtr,
    pub death_id: DeathId,
}

#[derive(Debug, Default)]
struct ProcState {
    endpoints: Vec<CPtr>,
    async_endpoints: Vec<CPtr>,
    dataspaces: BTreeMap<CPtr, SharedRegion>,
    notifications: Option<NotificationWriter>,
    param_buffer: Option<(CPtr, usize)>,
    watches: Vec<MockWatch>,
    next_death_id: usize,
    fail_watch: bool,
    fail_open: bool,
}

/// Process server double
#[derive(Debug, Default)]
pub struct MockProcServ {
    state: Mutex<ProcState>,
}

impl MockProcServ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous endpoints created so far
    pub fn endpoints(&self) -> Vec<CPtr> {
        self.state.lock().endpoints.clone()
    }

    /// Asynchronous endpoints created so far
    pub fn async_endpoints(&self) -> Vec<CPtr> {
        self.state.lock().async_endpoints.clone()
    }

    /// Mapping of an anonymous dataspace
    pub fn region(&self, dataspace: CPtr) -> Option<SharedRegion> {
        self.state.lock().dataspaces.get(&dataspace).cloned()
    }

    /// Registered parameter buffer and size
    pub fn param_buffer(&self) -> Option<(CPtr, usize)> {
        self.state.lock().param_buffer
    }

    /// Whether a notification buffer has been registered
    pub fn has_notification_buffer(&self) -> bool {
        self.state.lock().notifications.is_some()
    }

    /// Death watch on `liveness`
    pub fn watch(&self, liveness: CPtr) -> Option<MockWatch> {
        self.state.lock().watches.iter().find(|w| w.liveness == liveness).copied()
    }

    /// Number of active death watches
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Make the next `watch_client` fail
    pub fn fail_next_watch(&self) {
        self.state.lock().fail_watch = true;
    }

    /// Make the next `open_anon` fail
    pub fn fail_next_open(&self) {
        self.state.lock().fail_open = true;
    }

    /// Kill the client named by `liveness`: drop its watch and write a
    /// death notice into the notification ring. The caller delivers the
    /// signal on the returned endpoint.
    pub fn kill_client(&self, liveness: CPtr) -> SrvResult<MockWatch> {
        let mut st = self.state.lock();
        let idx = st
            .watches
            .iter()
            .position(|w| w.liveness == liveness)
            .ok_or(SrvError::NotFound)?;
        let watch = st.watches.remove(idx);
        st.notifications
            .as_mut()
            .ok_or(SrvError::Unsupported)?
            .post_death(watch.death_id)?;
        Ok(watch)
    }

    /// Write a fault notice into the notification ring
    pub fn post_fault(&self, notice: FaultNotice) -> SrvResult<()> {
        self.state
            .lock()
            .notifications
            .as_mut()
            .ok_or(SrvError::Unsupported)?
            .post_fault(notice)
    }

    /// Write a content-init notice into the notification ring
    pub fn post_content_init(&self, notice: ContentInitNotice) -> SrvResult<()> {
        self.state
            .lock()
            .notifications
            .as_mut()
            .ok_or(SrvError::Unsupported)?
            .post_content_init(notice)
    }

    /// Write a raw record into the notification ring
    pub fn post_record(&self, record: &Notification) -> SrvResult<()> {
        self.state
            .lock()
            .notifications
            .as_mut()
            .ok_or(SrvError::Unsupported)?
            .post_record(record)
    }
}

impl ProcServ for MockProcServ {
    fn new_endpoint(&self, dest: CPtr) -> SrvResult<()> {
        self.state.lock().endpoints.push(dest);
        Ok(())
    }

    fn new_async_endpoint(&self, dest: CPtr) -> SrvResult<()> {
        self.state.lock().async_endpoints.push(dest);
        Ok(())
    }

    fn watch_client(&self, liveness: CPtr, notify_ep: CPtr) -> SrvResult<DeathId> {
        let mut st = self.state.lock();
        if core::mem::take(&mut st.fail_watch) {
            return Err(SrvError::Kernel(MOCK_INJECTED_FAILURE));
        }
        st.watches.retain(|w| w.liveness != liveness);
        st.next_death_id += 1;
        let death_id = DeathId(st.next_death_id);
        st.watches.push(MockWatch {
            liveness,
            notify_ep,
            death_id,
        });
        Ok(death_id)
    }

    fn unwatch_client(&self, liveness: CPtr) -> SrvResult<()> {
        let mut st = self.state.lock();
        let before = st.watches.len();
        st.watches.retain(|w| w.liveness != liveness);
        if st.watches.len() == before {
            return Err(SrvError::NotFound);
        }
        Ok(())
    }

    fn open_anon(&self, size: usize, dest: CPtr) -> SrvResult<SharedRegion> {
        let mut st = self.state.lock();
        if core::mem::take(&mut st.fail_open) {
            return Err(SrvError::ResourceExhausted);
        }
        let region = SharedRegion::anon(size);
        st.dataspaces.insert(dest, region.clone());
        Ok(region)
    }

    fn set_notification_buffer(&self, dataspace: CPtr) -> SrvResult<()> {
        let mut st = self.state.lock();
        let region = st.dataspaces.get(&dataspace).cloned().ok_or(SrvError::NotFound)?;
        st.notifications = Some(NotificationWriter::new(region));
        Ok(())
    }

    fn set_param_buffer(&self, dataspace: CPtr, size: usize) -> SrvResult<()> {
        let mut st = self.state.lock();
        if !st.dataspaces.contains_key(&dataspace) {
            return Err(SrvError::NotFound);
        }
        st.param_buffer = Some((dataspace, size));
        Ok(())
    }
}
