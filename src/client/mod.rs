//! Client session table
//!
//! Tracks the clients connected to a server. Each session owns the
//! client's liveness capability (used by the process server to identify and
//! watch the client), a session endpoint minted with a per-client badge, and
//! optionally a shared parameter buffer.
//!
//! Sessions are never destroyed in the middle of handling a request: a
//! disconnect or death only queues the session, and the queue is flushed by
//! [`ClientTable::postaction`] once the reply has been sent.

use alloc::vec::Vec;
use core::ops::Range;

use crate::cspace::{CSlot, CapSpace};
use crate::error::{SrvError, SrvResult};
use crate::oat::{ObjectFactory, ObjectTable};
use crate::types::{Badge, CPtr, ClientId, DeathId};

/// Capability space handed to session construction and teardown
pub type SessionEnv = dyn CapSpace + 'static;

// ============================================================================
// Session
// ============================================================================

/// A parameter buffer shared by a client
#[derive(Debug)]
pub struct ParamBuffer {
    /// Dataspace capability copied out of the client's request
    pub dataspace: CSlot,
    /// Size in bytes
    pub size: usize,
    /// Read offset into the buffer
    pub start: usize,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, death watch not yet registered
    Connecting,
    /// Fully connected
    Active,
    /// Queued for destruction after the current dispatch
    PendingDelete,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    id: ClientId,
    badge: Badge,
    liveness: CSlot,
    session: CSlot,
    active: bool,
    /// Correlation ID from the process server death watch
    pub death_id: Option<DeathId>,
    /// Shared parameter buffer, if the client set one
    pub param_buffer: Option<ParamBuffer>,
}

impl Session {
    /// Client ID
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Badge on the session endpoint
    pub fn badge(&self) -> Badge {
        self.badge
    }

    /// The client's liveness capability
    pub fn liveness(&self) -> CPtr {
        self.liveness.cptr()
    }

    /// The badged session endpoint handed back to the client
    pub fn session_cap(&self) -> CPtr {
        self.session.cptr()
    }

    /// Mark the connection complete
    pub fn mark_active(&mut self) {
        self.active = true;
    }

    /// Replace the parameter buffer, returning the previous one
    pub fn set_param_buffer(&mut self, buffer: Option<ParamBuffer>) -> Option<ParamBuffer> {
        core::mem::replace(&mut self.param_buffer, buffer)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds sessions by minting badged copies of the session source endpoint
#[derive(Debug, Clone, Copy)]
pub struct SessionFactory {
    badge_base: usize,
    session_src_ep: CPtr,
}

fn release_logged(cs: &mut SessionEnv, slot: CSlot, what: &str) {
    let cptr = slot.cptr();
    if let Err(e) = cs.release_slot(slot) {
        log::warn!("client table: failed to release {} {}: {}", what, cptr, e);
    }
}

impl ObjectFactory for SessionFactory {
    type Object = Session;
    type Args = CSlot;
    type Env = SessionEnv;

    fn create(&mut self, cs: &mut SessionEnv, id: ClientId, liveness: CSlot) -> SrvResult<Session> {
        let badge = Badge(id + self.badge_base);
        match cs.mint(self.session_src_ep, badge) {
            Ok(session) => Ok(Session {
                id,
                badge,
                liveness,
                session,
                active: false,
                death_id: None,
                param_buffer: None,
            }),
            Err(e) => {
                log::warn!("client table: mint for client {} failed: {}", id, e);
                release_logged(cs, liveness, "liveness");
                Err(e)
            }
        }
    }

    fn destroy(&mut self, cs: &mut SessionEnv, id: ClientId, obj: Session) {
        log::debug!("client table: destroying client {}", id);
        release_logged(cs, obj.liveness, "liveness");
        release_logged(cs, obj.session, "session");
        if let Some(pb) = obj.param_buffer {
            release_logged(cs, pb.dataspace, "param buffer");
        }
    }

    fn reject(&mut self, cs: &mut SessionEnv, liveness: CSlot) {
        release_logged(cs, liveness, "liveness");
    }
}

// ============================================================================
// Client table
// ============================================================================

/// Table of connected clients with deferred deletion
pub struct ClientTable {
    table: ObjectTable<SessionFactory>,
    pending: Vec<ClientId>,
    badge_base: usize,
    badge_end: usize,
}

impl ClientTable {
    /// Create a table issuing client IDs in `[1, max_clients)`. Session
    /// endpoints are minted from `session_src_ep` with badge
    /// `client_id + badge_base`.
    pub fn new(max_clients: usize, badge_base: usize, session_src_ep: CPtr) -> SrvResult<Self> {
        let badges = Self::session_badges(max_clients, badge_base)?;
        let factory = SessionFactory {
            badge_base,
            session_src_ep,
        };
        Ok(Self {
            table: ObjectTable::new(1, max_clients, factory)?,
            pending: Vec::new(),
            badge_base,
            badge_end: badges.end,
        })
    }

    /// Badges a table of `max_clients` based at `badge_base` hands out.
    /// `InvalidArgument` if the range overflows a word.
    pub fn session_badges(max_clients: usize, badge_base: usize) -> SrvResult<Range<usize>> {
        let end = badge_base
            .checked_add(max_clients)
            .ok_or(SrvError::InvalidArgument)?;
        Ok(badge_base.saturating_add(1)..end)
    }

    /// Create a session for a client, taking ownership of its liveness
    /// capability. The liveness slot is released on failure.
    pub fn alloc(&mut self, cs: &mut SessionEnv, liveness: CSlot) -> SrvResult<ClientId> {
        let (id, session) = self.table.alloc(cs, liveness)?;
        log::debug!("client table: allocated client {} badge {}", id, session.badge());
        Ok(id)
    }

    /// Look up a session by client ID
    pub fn get(&self, id: ClientId) -> Option<&Session> {
        self.table.get(id)
    }

    /// Look up a session by client ID mutably
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Session> {
        self.table.get_mut(id)
    }

    /// Translate a session badge to a client ID
    pub fn client_id(&self, badge: Badge) -> Option<ClientId> {
        let b = badge.value();
        if b < self.badge_base || b >= self.badge_end {
            return None;
        }
        Some(b - self.badge_base)
    }

    /// Look up a session by the badge its requests arrive with
    pub fn get_by_badge(&self, badge: Badge) -> Option<&Session> {
        self.client_id(badge).and_then(|id| self.get(id))
    }

    /// Look up a session by badge mutably
    pub fn get_by_badge_mut(&mut self, badge: Badge) -> Option<&mut Session> {
        self.client_id(badge).and_then(move |id| self.get_mut(id))
    }

    /// Queue a session for destruction after the current dispatch.
    ///
    /// Queueing twice is harmless. Unknown IDs are reported as `NotFound`
    /// and otherwise ignored.
    pub fn queue_delete(&mut self, id: ClientId) -> SrvResult<()> {
        if self.get(id).is_none() {
            return Err(SrvError::NotFound);
        }
        if !self.pending.contains(&id) {
            log::debug!("client table: queueing client {} for deletion", id);
            self.pending.push(id);
        }
        Ok(())
    }

    /// Queue the session whose death watch carries `death_id`
    pub fn queue_delete_by_deathwatch(&mut self, death_id: DeathId) -> SrvResult<ClientId> {
        let id = self
            .table
            .iter()
            .find(|(_, s)| s.death_id == Some(death_id))
            .map(|(id, _)| id)
            .ok_or(SrvError::NotFound)?;
        self.queue_delete(id)?;
        Ok(id)
    }

    /// Whether a session is queued for destruction
    pub fn is_pending(&self, id: ClientId) -> bool {
        self.pending.contains(&id)
    }

    /// Sessions queued for destruction
    pub fn pending(&self) -> &[ClientId] {
        &self.pending
    }

    /// Lifecycle state of a session; `None` once destroyed
    pub fn state(&self, id: ClientId) -> Option<SessionState> {
        let session = self.get(id)?;
        Some(if self.is_pending(id) {
            SessionState::PendingDelete
        } else if session.active {
            SessionState::Active
        } else {
            SessionState::Connecting
        })
    }

    /// Destroy every queued session. Returns how many were destroyed.
    pub fn postaction(&mut self, cs: &mut SessionEnv) -> usize {
        let mut destroyed = 0;
        for id in self.pending.drain(..) {
            match self.table.free(cs, id) {
                Ok(()) => destroyed += 1,
                Err(e) => log::warn!("client table: free of client {} failed: {}", id, e),
            }
        }
        destroyed
    }

    /// Destroy every session and the table itself
    pub fn release(self, cs: &mut SessionEnv) {
        let _ = self.table.release(cs);
    }

    /// Live sessions in ID order
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.table.iter().map(|(_, s)| s)
    }

    /// Number of live sessions, including queued ones
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// First badge value in use
    pub fn badge_base(&self) -> usize {
        self.badge_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cspace::{CSpace, SlotAllocator};
    use crate::testing::MockKernel;
    use alloc::sync::Arc;

    const SRC_EP: CPtr = CPtr(0x10);

    fn setup() -> (Arc<MockKernel>, CSpace<Arc<MockKernel>>) {
        let kernel = Arc::new(MockKernel::new());
        let cs = CSpace::new(kernel.clone(), SlotAllocator::new(CPtr(0x100), CPtr(0x200)).unwrap());
        (kernel, cs)
    }

    fn connect(table: &mut ClientTable, cs: &mut CSpace<Arc<MockKernel>>) -> SrvResult<ClientId> {
        let liveness = cs.alloc_slot()?;
        table.alloc(cs, liveness)
    }

    #[test]
    fn test_badges_follow_ids() {
        let (kernel, mut cs) = setup();
        let mut table = ClientTable::new(4, 1000, SRC_EP).unwrap();
        for expected in 1..4 {
            let id = connect(&mut table, &mut cs).unwrap();
            assert_eq!(id, expected);
            let session = table.get(id).unwrap();
            assert_eq!(session.badge(), Badge(1000 + id));
            assert_eq!(kernel.badge_of(session.session_cap()), Some(Badge(1000 + id)));
        }
        assert_eq!(connect(&mut table, &mut cs), Err(SrvError::ResourceExhausted));
    }

    #[test]
    fn test_get_by_badge_range() {
        let (_kernel, mut cs) = setup();
        let mut table = ClientTable::new(4, 1000, SRC_EP).unwrap();
        let id = connect(&mut table, &mut cs).unwrap();
        assert_eq!(table.get_by_badge(Badge(1000 + id)).map(Session::id), Some(id));
        assert!(table.get_by_badge(Badge(999)).is_none());
        assert!(table.get_by_badge(Badge(1004)).is_none());
        assert!(table.get_by_badge(Badge(1002)).is_none());
    }

    #[test]
    fn test_badge_range_overflow_rejected() {
        assert_eq!(
            ClientTable::new(8, usize::MAX - 4, SRC_EP).err(),
            Some(SrvError::InvalidArgument)
        );
        assert_eq!(ClientTable::session_badges(4, 1000), Ok(1001..1004));

        let table = ClientTable::new(4, usize::MAX - 4, SRC_EP).unwrap();
        assert_eq!(table.client_id(Badge(usize::MAX)), None);
        assert_eq!(table.client_id(Badge(usize::MAX - 1)), Some(3));
    }

    #[test]
    fn test_deferred_delete() {
        let (kernel, mut cs) = setup();
        let mut table = ClientTable::new(8, 0, SRC_EP).unwrap();
        let id = connect(&mut table, &mut cs).unwrap();
        let session_cap = table.get(id).unwrap().session_cap();

        table.queue_delete(id).unwrap();
        table.queue_delete(id).unwrap();
        assert_eq!(table.pending(), &[id]);
        assert_eq!(table.state(id), Some(SessionState::PendingDelete));
        assert!(table.get(id).is_some());

        assert_eq!(table.postaction(&mut cs), 1);
        assert!(table.get(id).is_none());
        assert!(table.pending().is_empty());
        assert!(kernel.deleted().contains(&session_cap));
    }

    #[test]
    fn test_queue_unknown_ignored() {
        let mut table = ClientTable::new(8, 0, SRC_EP).unwrap();
        assert_eq!(table.queue_delete(5), Err(SrvError::NotFound));
        assert!(table.pending().is_empty());
    }

    #[test]
    fn test_deathwatch_lookup() {
        let (_kernel, mut cs) = setup();
        let mut table = ClientTable::new(8, 0, SRC_EP).unwrap();
        let a = connect(&mut table, &mut cs).unwrap();
        let b = connect(&mut table, &mut cs).unwrap();
        table.get_mut(a).unwrap().death_id = Some(DeathId(50));
        table.get_mut(b).unwrap().death_id = Some(DeathId(51));

        assert_eq!(table.queue_delete_by_deathwatch(DeathId(51)), Ok(b));
        assert_eq!(table.pending(), &[b]);
        assert_eq!(
            table.queue_delete_by_deathwatch(DeathId(99)),
            Err(SrvError::NotFound)
        );
    }

    #[test]
    fn test_mint_failure_releases_liveness() {
        let (kernel, mut cs) = setup();
        let mut table = ClientTable::new(8, 0, SRC_EP).unwrap();
        let liveness = cs.alloc_slot().unwrap();
        let raw = liveness.cptr();
        kernel.fail_next_mint();
        assert!(table.alloc(&mut cs, liveness).is_err());
        assert!(cs.slots().is_free(raw));
        assert!(table.is_empty());
        assert_eq!(connect(&mut table, &mut cs), Ok(1));
    }

    #[test]
    fn test_state_transitions() {
        let (_kernel, mut cs) = setup();
        let mut table = ClientTable::new(8, 0, SRC_EP).unwrap();
        let id = connect(&mut table, &mut cs).unwrap();
        assert_eq!(table.state(id), Some(SessionState::Connecting));
        table.get_mut(id).unwrap().mark_active();
        assert_eq!(table.state(id), Some(SessionState::Active));
        table.queue_delete(id).unwrap();
        table.postaction(&mut cs);
        assert_eq!(table.state(id), None);
    }
}
