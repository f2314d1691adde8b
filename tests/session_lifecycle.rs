//! End-to-end session lifecycle through the server runtime
//!
//! Drives a server built on `ServerCommon` with the in-memory kernel and
//! process server: connect, deferred disconnect, ID recycling, death
//! notification and parameter buffers.

use std::sync::Arc;

use srvkit::cspace::{CSpace, SlotAllocator};
use srvkit::error::SrvError;
use srvkit::rpc::{
    reply_result, Dispatch, Message, SERV_CONNECT_DIRECT, SERV_DISCONNECT_DIRECT, SERV_PING,
    SERV_SET_PARAM_BUFFER,
};
use srvkit::server::{BasicService, ServerCommon, ServerConfig, SRV_DEFAULT_NOTIFY_BADGE};
use srvkit::client::SessionState;
use srvkit::testing::{MockKernel, MockProcServ};
use srvkit::{Badge, CPtr, ClientId};

type Server = ServerCommon<Arc<MockKernel>, Arc<MockProcServ>>;

const BADGE_BASE: usize = 1000;

struct Harness {
    kernel: Arc<MockKernel>,
    procserv: Arc<MockProcServ>,
    srv: Server,
}

impl Harness {
    fn new(max_clients: usize) -> Self {
        let kernel = Arc::new(MockKernel::new());
        let procserv = Arc::new(MockProcServ::new());
        let cs = CSpace::new(kernel.clone(), SlotAllocator::new(CPtr(0x100), CPtr(0x800)).unwrap());
        let config = ServerConfig::new("lifecycle")
            .with_max_clients(max_clients)
            .with_client_badge_base(BADGE_BASE)
            .with_notification_buffer(0x1000)
            .with_param_buffer(0);
        let srv = ServerCommon::init(config, cs, procserv.clone(), None).unwrap();
        Self {
            kernel,
            procserv,
            srv,
        }
    }

    /// Queue `msg`, run one server iteration, and return the reply
    fn call(&mut self, msg: Message) -> (Dispatch, Option<Message>) {
        self.kernel.push_message(msg);
        let outcome = self.srv.serve_once(&mut BasicService).unwrap();
        (outcome, self.kernel.take_reply())
    }

    fn connect(&mut self, liveness: usize) -> Result<(ClientId, CPtr), SrvError> {
        let (_, reply) = self.call(Message::new(SERV_CONNECT_DIRECT).with_cap(CPtr(liveness)));
        let mut reply = reply.expect("connect always replies");
        reply_result(&mut reply)?;
        let id = reply.pop().unwrap();
        Ok((id, reply.caps[0]))
    }

    fn session_request(&mut self, label: usize, id: ClientId) -> Message {
        Message::new(label).with_badge(Badge(BADGE_BASE + id))
    }
}

#[test]
fn test_connect_until_full_then_recycle() {
    let mut h = Harness::new(4);

    for expected in 1..=3 {
        let (id, session) = h.connect(0x70 + expected).unwrap();
        assert_eq!(id, expected);
        assert_eq!(h.kernel.badge_of(session), Some(Badge(BADGE_BASE + expected)));
        assert_eq!(h.srv.clients().unwrap().state(id), Some(SessionState::Active));
    }
    assert_eq!(h.connect(0x80), Err(SrvError::ResourceExhausted));
    assert_eq!(h.srv.clients().unwrap().len(), 3);

    // Disconnect is deferred until after the reply
    let msg = h.session_request(SERV_DISCONNECT_DIRECT, 2);
    h.kernel.deliver(&msg);
    assert_eq!(h.srv.handle(&mut BasicService, msg), Dispatch::Success);
    let mut reply = h.kernel.take_reply().unwrap();
    assert_eq!(reply_result(&mut reply), Ok(()));
    assert_eq!(
        h.srv.clients().unwrap().state(2),
        Some(SessionState::PendingDelete)
    );
    assert!(h.srv.clients().unwrap().get(2).is_some());

    assert_eq!(h.srv.postaction(), 1);
    assert!(h.srv.clients().unwrap().get(2).is_none());
    assert!(h.srv.clients().unwrap().get(1).is_some());
    assert!(h.srv.clients().unwrap().get(3).is_some());

    // The freed ID is reused with the same badge
    let (id, session) = h.connect(0x90).unwrap();
    assert_eq!(id, 2);
    assert_eq!(h.kernel.badge_of(session), Some(Badge(BADGE_BASE + 2)));
}

#[test]
fn test_disconnect_through_serve_loop_sweeps() {
    let mut h = Harness::new(8);
    let (id, session) = h.connect(0x71).unwrap();
    let liveness = h.srv.clients().unwrap().get(id).unwrap().liveness();
    assert!(h.procserv.watch(liveness).is_some());

    let msg = h.session_request(SERV_DISCONNECT_DIRECT, id);
    let (outcome, reply) = h.call(msg);
    assert_eq!(outcome, Dispatch::Success);
    assert_eq!(reply_result(&mut reply.unwrap()), Ok(()));

    assert!(h.srv.clients().unwrap().get(id).is_none());
    assert!(h.procserv.watch(liveness).is_none());
    assert!(h.kernel.deleted().contains(&session));
    assert!(h.kernel.deleted().contains(&liveness));
}

#[test]
fn test_client_death_notification() {
    let mut h = Harness::new(8);
    let (a, _) = h.connect(0x71).unwrap();
    let (b, _) = h.connect(0x72).unwrap();
    let liveness = h.srv.clients().unwrap().get(a).unwrap().liveness();

    let watch = h.procserv.kill_client(liveness).unwrap();
    assert_eq!(watch.notify_ep, h.srv.notify_ep());

    let signal = Message::new(0).with_badge(Badge(SRV_DEFAULT_NOTIFY_BADGE));
    let (outcome, reply) = h.call(signal);
    assert_eq!(outcome, Dispatch::Success);
    assert!(reply.is_none());

    assert!(h.srv.clients().unwrap().get(a).is_none());
    assert!(h.srv.clients().unwrap().get(b).is_some());
}

#[test]
fn test_ping_needs_live_session() {
    let mut h = Harness::new(8);
    let (id, _) = h.connect(0x71).unwrap();

    let (outcome, reply) = h.call(h_ping(id));
    assert_eq!(outcome, Dispatch::Success);
    assert_eq!(reply_result(&mut reply.unwrap()), Ok(()));

    let (outcome, reply) = h.call(h_ping(5));
    assert_eq!(outcome, Dispatch::Error);
    assert_eq!(reply_result(&mut reply.unwrap()), Err(SrvError::NotFound));
}

fn h_ping(id: ClientId) -> Message {
    Message::new(SERV_PING).with_badge(Badge(BADGE_BASE + id))
}

#[test]
fn test_badged_connect_rejected() {
    let mut h = Harness::new(8);
    let msg = Message::new(SERV_CONNECT_DIRECT)
        .with_badge(Badge(BADGE_BASE + 1))
        .with_cap(CPtr(0x71));
    let (outcome, reply) = h.call(msg);
    assert_eq!(outcome, Dispatch::Error);
    assert_eq!(
        reply_result(&mut reply.unwrap()),
        Err(SrvError::PermissionOrProtocol)
    );
}

#[test]
fn test_param_buffer_set_replace_unset() {
    let mut h = Harness::new(8);
    let (id, _) = h.connect(0x71).unwrap();

    let set = |ds: usize, size: usize| {
        Message::new(SERV_SET_PARAM_BUFFER)
            .with_badge(Badge(BADGE_BASE + id))
            .with_cap(CPtr(ds))
            .with_word(size)
    };

    let (outcome, _) = h.call(set(0x500, 0x1000));
    assert_eq!(outcome, Dispatch::Success);
    let first = {
        let session = h.srv.clients().unwrap().get(id).unwrap();
        let pb = session.param_buffer.as_ref().unwrap();
        assert_eq!(pb.size, 0x1000);
        assert_eq!(pb.start, 0);
        pb.dataspace.cptr()
    };

    let (outcome, _) = h.call(set(0x501, 0x2000));
    assert_eq!(outcome, Dispatch::Success);
    assert!(h.kernel.revoked().contains(&first));
    let second = h.srv.clients().unwrap().get(id).unwrap().param_buffer.as_ref().unwrap();
    assert_eq!(second.size, 0x2000);
    let second = second.dataspace.cptr();

    // Size zero without a capability clears the buffer
    let unset = Message::new(SERV_SET_PARAM_BUFFER)
        .with_badge(Badge(BADGE_BASE + id))
        .with_word(0);
    let (outcome, _) = h.call(unset);
    assert_eq!(outcome, Dispatch::Success);
    assert!(h.srv.clients().unwrap().get(id).unwrap().param_buffer.is_none());
    assert!(h.kernel.revoked().contains(&second));

    // Size zero with a capability is invalid
    let (outcome, reply) = h.call(set(0x502, 0));
    assert_eq!(outcome, Dispatch::Error);
    assert_eq!(reply_result(&mut reply.unwrap()), Err(SrvError::InvalidArgument));
}

#[test]
fn test_shutdown_releases_everything() {
    let mut h = Harness::new(8);
    let (_, session) = h.connect(0x71).unwrap();
    let anon = h.srv.anon_ep();
    let Harness { kernel, srv, .. } = h;

    let cs = srv.shutdown(None);
    assert_eq!(cs.slots().in_use(), 0);
    let deleted = kernel.deleted();
    assert!(deleted.contains(&session));
    assert!(deleted.contains(&anon));
}
