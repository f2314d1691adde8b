//! Server common runtime
//!
//! Everything a system server needs before it can handle its first request:
//! an anonymous endpoint published in the name service, an asynchronous
//! endpoint for process server notifications, a client session table, and
//! the notification and parameter buffers shared with the process server.
//!
//! A server plugs its own request handling in through [`Service`] and runs
//! [`ServerCommon::serve_once`] in a loop. Every iteration ends with the
//! client table sweep, so sessions queued for deletion while handling a
//! request are destroyed only after the reply went out.

use alloc::string::String;

use crate::client::{ClientTable, ParamBuffer};
use crate::cspace::{CSlot, CSpace, CapSpace};
use crate::error::{SrvError, SrvResult};
use crate::kernel::Kernel;
use crate::nameserv::NameResolver;
use crate::procserv::ProcServ;
use crate::rpc::{self, Dispatch, Message, ServRequest};
use crate::share::notify::{
    ContentInitNotice, DeathNotice, FaultNotice, Notification, NotifyEvent, NOTIFICATION_SIZE,
};
use crate::share::{ShareReader, SharedRegion};
use crate::types::{Badge, CPtr, ClientId};

// ============================================================================
// Configuration
// ============================================================================

/// Badge value of unbadged capabilities
pub const SRV_UNBADGED: usize = 0;

/// Default client table size
pub const SRV_DEFAULT_MAX_CLIENTS: usize = 2048;

/// Default first client badge
pub const SRV_DEFAULT_CLIENT_BADGE_BASE: usize = 0x1000;

/// Default badge on the fault and death notification endpoint
pub const SRV_DEFAULT_NOTIFY_BADGE: usize = 0x10;

/// Default notification buffer size
pub const SRV_DEFAULT_NOTIFICATION_BUFFER_SIZE: usize = 0x8000;

/// Default parameter buffer size
pub const SRV_DEFAULT_PARAM_BUFFER_SIZE: usize = 0x2000;

/// Server construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Name used in log messages
    pub server_name: String,
    /// Client IDs are issued from `[1, max_clients)`; 0 disables sessions
    pub max_clients: usize,
    /// Session badge of client `n` is `client_badge_base + n`
    pub client_badge_base: usize,
    /// Notification ring size; 0 for none
    pub notification_buffer_size: usize,
    /// Parameter buffer to the process server; 0 for none
    pub param_buffer_size: usize,
    /// Path to publish the anonymous endpoint under
    pub mount_point: Option<String>,
    /// Name server to publish the mount point with
    pub name_serv_ep: CPtr,
    /// Badge identifying fault and death notifications
    pub fault_death_badge: Badge,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: String::from("server"),
            max_clients: SRV_DEFAULT_MAX_CLIENTS,
            client_badge_base: SRV_DEFAULT_CLIENT_BADGE_BASE,
            notification_buffer_size: SRV_DEFAULT_NOTIFICATION_BUFFER_SIZE,
            param_buffer_size: SRV_DEFAULT_PARAM_BUFFER_SIZE,
            mount_point: None,
            name_serv_ep: CPtr::NULL,
            fault_death_badge: Badge(SRV_DEFAULT_NOTIFY_BADGE),
        }
    }
}

impl ServerConfig {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: String::from(server_name),
            ..Self::default()
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_client_badge_base(mut self, base: usize) -> Self {
        self.client_badge_base = base;
        self
    }

    pub fn with_notification_buffer(mut self, size: usize) -> Self {
        self.notification_buffer_size = size;
        self
    }

    pub fn with_param_buffer(mut self, size: usize) -> Self {
        self.param_buffer_size = size;
        self
    }

    /// Publish the anonymous endpoint as `path` at the name server `ns_ep`
    pub fn with_mount_point(mut self, ns_ep: CPtr, path: &str) -> Self {
        self.name_serv_ep = ns_ep;
        self.mount_point = Some(String::from(path));
        self
    }

    pub fn with_fault_death_badge(mut self, badge: Badge) -> Self {
        self.fault_death_badge = badge;
        self
    }
}

// ============================================================================
// Handler traits
// ============================================================================

/// Reactions to process server notifications
pub trait NotifyHandler<K: Kernel + 'static, P: ProcServ> {
    /// A client faulted on a window this server backs
    fn on_fault(&mut self, _srv: &mut ServerCommon<K, P>, notice: FaultNotice) -> SrvResult<()> {
        log::warn!("unhandled fault notification at {:#x}", notice.fault_addr);
        Err(SrvError::Unsupported)
    }

    /// A dataspace this server backs needs initial content
    fn on_content_init(
        &mut self,
        _srv: &mut ServerCommon<K, P>,
        notice: ContentInitNotice,
    ) -> SrvResult<()> {
        log::warn!("unhandled content-init notification for {}", notice.dataspace_id);
        Err(SrvError::Unsupported)
    }

    /// A watched client died
    fn on_death(&mut self, srv: &mut ServerCommon<K, P>, notice: DeathNotice) -> SrvResult<()> {
        let clients = srv.clients_mut().ok_or(SrvError::Unsupported)?;
        let id = clients.queue_delete_by_deathwatch(notice.death_id)?;
        log::debug!("client {} died, queued for deletion", id);
        Ok(())
    }
}

/// A server's request handling
pub trait Service<K: Kernel + 'static, P: ProcServ>: NotifyHandler<K, P> {
    /// Handle a request outside the serv protocol. `Ok(None)` passes.
    fn dispatch(&mut self, _srv: &mut ServerCommon<K, P>, _msg: &mut Message) -> SrvResult<Option<Message>> {
        Ok(None)
    }

    fn on_connect(&mut self, srv: &mut ServerCommon<K, P>, msg: &Message) -> SrvResult<ClientId> {
        srv.connect_direct(msg)
    }

    fn on_ping(&mut self, _srv: &mut ServerCommon<K, P>, _client: ClientId) -> SrvResult<()> {
        Ok(())
    }

    fn on_set_param_buffer(
        &mut self,
        srv: &mut ServerCommon<K, P>,
        client: ClientId,
        msg: &Message,
        size: usize,
    ) -> SrvResult<()> {
        srv.set_param_buffer(client, msg, size)
    }

    fn on_disconnect(&mut self, srv: &mut ServerCommon<K, P>, client: ClientId) -> SrvResult<()> {
        srv.disconnect_direct(client)
    }
}

/// A service that only speaks the serv protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicService;

impl<K: Kernel + 'static, P: ProcServ> NotifyHandler<K, P> for BasicService {}
impl<K: Kernel + 'static, P: ProcServ> Service<K, P> for BasicService {}

// ============================================================================
// Server state
// ============================================================================

/// A mapped dataspace
#[derive(Debug)]
pub struct MappedBuffer {
    dataspace: CSlot,
    region: SharedRegion,
}

impl MappedBuffer {
    pub fn dataspace(&self) -> CPtr {
        self.dataspace.cptr()
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

/// State shared by every server built on this runtime
pub struct ServerCommon<K, P> {
    config: ServerConfig,
    cspace: CSpace<K>,
    procserv: P,
    anon_ep: CSlot,
    notify_async_ep: CSlot,
    notify_badged_ep: CSlot,
    notify_buffer: Option<(MappedBuffer, ShareReader)>,
    param_buffer: Option<MappedBuffer>,
    clients: Option<ClientTable>,
}

fn open_buffer<K: Kernel, P: ProcServ>(
    cspace: &mut CSpace<K>,
    procserv: &P,
    size: usize,
) -> SrvResult<MappedBuffer> {
    let dataspace = cspace.alloc_slot()?;
    match procserv.open_anon(size, dataspace.cptr()) {
        Ok(region) => Ok(MappedBuffer { dataspace, region }),
        Err(e) => {
            cspace.free_slot(dataspace);
            Err(e)
        }
    }
}

impl<K: Kernel + 'static, P: ProcServ> ServerCommon<K, P> {
    /// Bring up the server.
    ///
    /// Steps run in order and the first failure is returned; resources
    /// acquired by earlier steps are not rolled back. `names` is required
    /// only when the configuration has a mount point.
    pub fn init(
        config: ServerConfig,
        mut cspace: CSpace<K>,
        procserv: P,
        names: Option<&dyn NameResolver>,
    ) -> SrvResult<Self> {
        let name = config.server_name.clone();
        log::debug!("{}: initialising", name);

        let step = |what: &str, e: SrvError| {
            log::error!("{}: {} failed: {}", name, what, e);
            e
        };

        // Notifications are recognised by badge alone
        if config.max_clients > 0 {
            let badges = ClientTable::session_badges(config.max_clients, config.client_badge_base)
                .map_err(|e| step("client badge range", e))?;
            if badges.contains(&config.fault_death_badge.value()) {
                return Err(step("client badge range", SrvError::InvalidArgument));
            }
        }

        let anon_ep = cspace
            .alloc_with(|_, dest| procserv.new_endpoint(dest))
            .map_err(|e| step("anon endpoint", e))?;

        let notify_async_ep = cspace
            .alloc_with(|_, dest| procserv.new_async_endpoint(dest))
            .map_err(|e| step("async endpoint", e))?;

        let notify_badged_ep = cspace
            .mint(notify_async_ep.cptr(), config.fault_death_badge)
            .map_err(|e| step("notify endpoint mint", e))?;

        cspace
            .kernel()
            .bind_notification(notify_async_ep.cptr())
            .map_err(|e| step("notification bind", e))?;

        if let Some(path) = &config.mount_point {
            let names = names.ok_or(SrvError::InvalidArgument)?;
            names
                .register(config.name_serv_ep, path, anon_ep.cptr())
                .map_err(|e| step("mount point registration", e))?;
            log::debug!("{}: mounted at [{}]", name, path);
        }

        let clients = if config.max_clients > 0 {
            Some(
                ClientTable::new(config.max_clients, config.client_badge_base, anon_ep.cptr())
                    .map_err(|e| step("client table", e))?,
            )
        } else {
            None
        };

        let notify_buffer = if config.notification_buffer_size > 0 {
            let buffer = open_buffer(&mut cspace, &procserv, config.notification_buffer_size)
                .map_err(|e| step("notification buffer", e))?;
            procserv
                .set_notification_buffer(buffer.dataspace())
                .map_err(|e| step("notification buffer registration", e))?;
            let reader = ShareReader::new(buffer.region.clone());
            Some((buffer, reader))
        } else {
            None
        };

        let param_buffer = if config.param_buffer_size > 0 {
            let buffer = open_buffer(&mut cspace, &procserv, config.param_buffer_size)
                .map_err(|e| step("param buffer", e))?;
            procserv
                .set_param_buffer(buffer.dataspace(), config.param_buffer_size)
                .map_err(|e| step("param buffer registration", e))?;
            Some(buffer)
        } else {
            None
        };

        log::info!("{}: ready, anon endpoint {}", name, anon_ep.cptr());
        Ok(Self {
            config,
            cspace,
            procserv,
            anon_ep,
            notify_async_ep,
            notify_badged_ep,
            notify_buffer,
            param_buffer,
            clients,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        self.cspace.kernel()
    }

    pub fn procserv(&self) -> &P {
        &self.procserv
    }

    pub fn cspace_mut(&mut self) -> &mut CSpace<K> {
        &mut self.cspace
    }

    /// Endpoint clients connect through
    pub fn anon_ep(&self) -> CPtr {
        self.anon_ep.cptr()
    }

    /// Badged endpoint the process server signals notifications on
    pub fn notify_ep(&self) -> CPtr {
        self.notify_badged_ep.cptr()
    }

    pub fn clients(&self) -> Option<&ClientTable> {
        self.clients.as_ref()
    }

    pub fn clients_mut(&mut self) -> Option<&mut ClientTable> {
        self.clients.as_mut()
    }

    pub fn notification_buffer(&self) -> Option<&MappedBuffer> {
        self.notify_buffer.as_ref().map(|(buffer, _)| buffer)
    }

    pub fn param_buffer(&self) -> Option<&MappedBuffer> {
        self.param_buffer.as_ref()
    }

    // ------------------------------------------------------------------------
    // Capability helpers
    // ------------------------------------------------------------------------

    /// Mint a badged copy of `ep` into a fresh slot
    pub fn mint(&mut self, badge: Badge, ep: CPtr) -> SrvResult<CSlot> {
        self.cspace.mint(ep, badge)
    }

    /// Check a request's capability shape
    pub fn check_dispatch_caps(msg: &Message, unwrapped_mask: usize, num_extra_caps: usize) -> bool {
        rpc::check_dispatch_caps(msg, unwrapped_mask, num_extra_caps)
    }

    /// Client ID of a session badge
    pub fn client_for(&self, badge: Badge) -> SrvResult<ClientId> {
        let clients = self.clients.as_ref().ok_or(SrvError::Unsupported)?;
        clients
            .client_id(badge)
            .filter(|&id| clients.get(id).is_some())
            .ok_or(SrvError::NotFound)
    }

    // ------------------------------------------------------------------------
    // Default serv protocol handlers
    // ------------------------------------------------------------------------

    /// Open a session for the client whose liveness capability came with
    /// `msg`, and register a death watch for it
    pub fn connect_direct(&mut self, msg: &Message) -> SrvResult<ClientId> {
        if !rpc::check_dispatch_caps(msg, 0, 1) {
            return Err(SrvError::PermissionOrProtocol);
        }
        let clients = self.clients.as_mut().ok_or(SrvError::Unsupported)?;
        let liveness = self.cspace.copyout(0)?;
        let id = clients.alloc(&mut self.cspace, liveness)?;

        let liveness = clients.get(id).map(|s| s.liveness()).ok_or(SrvError::NotFound)?;
        match self.procserv.watch_client(liveness, self.notify_badged_ep.cptr()) {
            Ok(death_id) => {
                if let Some(session) = clients.get_mut(id) {
                    session.death_id = Some(death_id);
                    session.mark_active();
                }
                log::debug!("{}: client {} connected", self.config.server_name, id);
                Ok(id)
            }
            Err(e) => {
                log::warn!("{}: death watch for client {} failed: {}", self.config.server_name, id, e);
                clients.queue_delete(id)?;
                clients.postaction(&mut self.cspace);
                Err(e)
            }
        }
    }

    /// Set or clear a client's parameter buffer.
    ///
    /// A request with no capability and size 0 clears the buffer. Otherwise
    /// the dataspace capability must be attached and `size` non-zero. A
    /// failure to release the previous buffer is logged, not returned.
    pub fn set_param_buffer(&mut self, client: ClientId, msg: &Message, size: usize) -> SrvResult<()> {
        let clients = self.clients.as_mut().ok_or(SrvError::Unsupported)?;
        if clients.get(client).is_none() {
            return Err(SrvError::NotFound);
        }

        let buffer = if msg.extra_caps() == 0 && size == 0 {
            None
        } else {
            if !rpc::check_dispatch_caps(msg, 0, 1) {
                return Err(SrvError::PermissionOrProtocol);
            }
            if size == 0 {
                return Err(SrvError::InvalidArgument);
            }
            Some(ParamBuffer {
                dataspace: self.cspace.copyout(0)?,
                size,
                start: 0,
            })
        };

        let old = clients
            .get_mut(client)
            .and_then(|session| session.set_param_buffer(buffer));
        if let Some(old) = old {
            let cptr = old.dataspace.cptr();
            if let Err(e) = self.cspace.revoke_release_slot(old.dataspace) {
                log::warn!(
                    "{}: release of client {} param buffer {} failed: {}",
                    self.config.server_name,
                    client,
                    cptr,
                    e
                );
            }
        }
        Ok(())
    }

    /// Queue a client for deletion and drop its death watch. A failed
    /// unwatch is logged; the session is destroyed regardless.
    pub fn disconnect_direct(&mut self, client: ClientId) -> SrvResult<()> {
        let clients = self.clients.as_mut().ok_or(SrvError::Unsupported)?;
        let liveness = clients.get(client).map(|s| s.liveness()).ok_or(SrvError::NotFound)?;
        clients.queue_delete(client)?;
        log::debug!("{}: client {} disconnecting", self.config.server_name, client);
        if let Err(e) = self.procserv.unwatch_client(liveness) {
            log::warn!("{}: unwatch of client {} failed: {}", self.config.server_name, client, e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Drain the notification ring, passing each record to `handler`.
    ///
    /// A corrupt or truncated record stops the drain with `Malformed`.
    /// Handler errors are logged and the drain continues; the first one is
    /// returned afterwards. Returns the number of records handled.
    pub fn dispatch_notifications<H>(&mut self, handler: &mut H) -> SrvResult<usize>
    where
        H: NotifyHandler<K, P> + ?Sized,
    {
        let mut handled = 0;
        let mut first_err = None;

        loop {
            let mut record = [0u8; NOTIFICATION_SIZE];
            let (_, reader) = self.notify_buffer.as_mut().ok_or(SrvError::Unsupported)?;
            if !reader.read_exact(&mut record)? {
                break;
            }
            let event = Notification::from_bytes(&record).event()?;
            log::trace!("{}: notification {:?}", self.config.server_name, event);
            handled += 1;

            let result = match event {
                NotifyEvent::Fault(notice) => handler.on_fault(self, notice),
                NotifyEvent::ContentInit(notice) => handler.on_content_init(self, notice),
                NotifyEvent::Death(notice) => handler.on_death(self, notice),
            };
            if let Err(e) = result {
                log::warn!("{}: notification handler failed: {}", self.config.server_name, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// Route one received message and send its reply, if any
    pub fn handle<S>(&mut self, service: &mut S, mut msg: Message) -> Dispatch
    where
        S: Service<K, P> + ?Sized,
    {
        if msg.badge == self.config.fault_death_badge {
            return match self.dispatch_notifications(service) {
                Ok(_) => Dispatch::Success,
                Err(e) => {
                    log::warn!("{}: notification dispatch failed: {}", self.config.server_name, e);
                    Dispatch::Error
                }
            };
        }

        let label = msg.label;
        let (outcome, reply) = match ServRequest::decode(&mut msg) {
            Ok(Some(req)) => self.handle_serv(service, req, &msg),
            Ok(None) => match service.dispatch(self, &mut msg) {
                Ok(Some(reply)) => (Dispatch::Success, Some(reply)),
                Ok(None) => {
                    log::warn!("{}: unknown label {:#x}", self.config.server_name, label);
                    (Dispatch::Pass, None)
                }
                Err(e) => (Dispatch::Error, Some(rpc::reply_status(label, Err(e), &[]))),
            },
            Err(e) => (Dispatch::Error, Some(rpc::reply_status(label, Err(e), &[]))),
        };

        if let Some(reply) = reply {
            if let Err(e) = self.cspace.kernel().reply(reply) {
                log::warn!("{}: reply failed: {}", self.config.server_name, e);
            }
        }
        outcome
    }

    fn handle_serv<S>(&mut self, service: &mut S, req: ServRequest, msg: &Message) -> (Dispatch, Option<Message>)
    where
        S: Service<K, P> + ?Sized,
    {
        let label = msg.label;
        let result = match req {
            ServRequest::ConnectDirect => {
                let connected = if msg.badge.value() == SRV_UNBADGED {
                    service.on_connect(self, msg)
                } else {
                    Err(SrvError::PermissionOrProtocol)
                };
                return match connected {
                    Ok(id) => {
                        let session = self.clients().and_then(|c| c.get(id)).map(|s| s.session_cap());
                        let mut reply = rpc::reply_status(label, Ok(()), &[id]);
                        reply.caps.extend(session);
                        (Dispatch::Success, Some(reply))
                    }
                    Err(e) => (Dispatch::Error, Some(rpc::reply_status(label, Err(e), &[]))),
                };
            }
            ServRequest::Ping => self
                .client_for(msg.badge)
                .and_then(|id| service.on_ping(self, id)),
            ServRequest::SetParamBuffer { size } => self
                .client_for(msg.badge)
                .and_then(|id| service.on_set_param_buffer(self, id, msg, size)),
            ServRequest::DisconnectDirect => self
                .client_for(msg.badge)
                .and_then(|id| service.on_disconnect(self, id)),
        };
        let outcome = if result.is_ok() { Dispatch::Success } else { Dispatch::Error };
        (outcome, Some(rpc::reply_status(label, result, &[])))
    }

    /// Destroy every session queued for deletion
    pub fn postaction(&mut self) -> usize {
        match self.clients.as_mut() {
            Some(clients) => clients.postaction(&mut self.cspace),
            None => 0,
        }
    }

    /// Receive one message on the anonymous endpoint, handle it, reply, and
    /// sweep the client table. The sweep runs even if handling failed.
    pub fn serve_once<S>(&mut self, service: &mut S) -> SrvResult<Dispatch>
    where
        S: Service<K, P> + ?Sized,
    {
        let msg = self.cspace.kernel().recv(self.anon_ep.cptr())?;
        let outcome = self.handle(service, msg);
        let swept = self.postaction();
        if swept > 0 {
            log::debug!("{}: swept {} clients", self.config.server_name, swept);
        }
        Ok(outcome)
    }

    /// Tear the server down, returning its capability space.
    ///
    /// Failures are logged; teardown always runs to completion.
    pub fn shutdown(mut self, names: Option<&dyn NameResolver>) -> CSpace<K> {
        let name = self.config.server_name.clone();
        if let (Some(path), Some(names)) = (&self.config.mount_point, names) {
            if let Err(e) = names.unregister(self.config.name_serv_ep, path) {
                log::warn!("{}: unregister of [{}] failed: {}", name, path, e);
            }
        }
        if let Some(clients) = self.clients.take() {
            clients.release(&mut self.cspace);
        }

        let mut slots = alloc::vec::Vec::new();
        if let Some((buffer, _)) = self.notify_buffer.take() {
            slots.push(buffer.dataspace);
        }
        if let Some(buffer) = self.param_buffer.take() {
            slots.push(buffer.dataspace);
        }
        slots.push(self.notify_badged_ep);
        slots.push(self.notify_async_ep);
        slots.push(self.anon_ep);
        for slot in slots {
            let cptr = slot.cptr();
            if let Err(e) = self.cspace.release_slot(slot) {
                log::warn!("{}: release of {} failed: {}", name, cptr, e);
            }
        }
        log::info!("{}: shut down", name);
        self.cspace
    }
}
