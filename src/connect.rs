//! Client-side connection helpers
//!
//! A client reaches a server by path. The path is resolved segment by
//! segment starting at the root name server until a server reports the rest
//! of the path as its own; that server's anonymous endpoint is then used to
//! open a session.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::cspace::{CSlot, CapSpace};
use crate::error::{SrvError, SrvResult};
use crate::nameserv::{NameResolver, Resolution};
use crate::procserv::ProcServ;
use crate::share::SharedRegion;
use crate::types::CPtr;

// ============================================================================
// Mount point resolution
// ============================================================================

/// A fully resolved path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Anonymous endpoint of the server owning the leaf
    pub server: CPtr,
    /// Root name server the walk started at
    pub name_root: CPtr,
    /// The resolved prefix of the path, including its trailing `/`
    pub prefix: String,
    /// The part of the path the server interprets
    pub dataspace_name: String,
}

/// Whether `path` has no further segment to forward
fn is_leaf(path: &str) -> bool {
    !path.strip_prefix('/').unwrap_or(path).contains('/')
}

/// Resolve `path` starting at the name server `root`
pub fn resolve_mount_point<R>(names: &R, root: CPtr, path: &str) -> SrvResult<MountPoint>
where
    R: NameResolver + ?Sized,
{
    let mut server = root;
    let mut offset = 0;

    loop {
        let rest = &path[offset..];
        let forward = if is_leaf(rest) {
            None
        } else {
            match names.resolve_segment(server, rest)? {
                Resolution::Local => None,
                Resolution::Forward { endpoint, consumed } => Some((endpoint, consumed)),
            }
        };

        let Some((endpoint, consumed)) = forward else {
            log::trace!("connect: [{}] resolved at {} ({})", path, server, rest);
            return Ok(MountPoint {
                server,
                name_root: root,
                prefix: path[..offset].to_string(),
                dataspace_name: rest.to_string(),
            });
        };

        if consumed == 0 || consumed > rest.len() || !rest.is_char_boundary(consumed) {
            log::warn!("connect: [{}] bad resolution offset {} at {}", path, consumed, server);
            return Err(SrvError::Malformed);
        }
        server = endpoint;
        offset += consumed;
        if path[offset..].starts_with('/') {
            offset += 1;
        }
    }
}

// ============================================================================
// Serv protocol client
// ============================================================================

/// Client side of the serv protocol
pub trait ServClient {
    /// Connect through the server's anonymous endpoint, presenting our
    /// liveness capability. The session endpoint lands in `dest`.
    fn connect_direct(&self, anon: CPtr, liveness: CPtr, dest: CPtr) -> SrvResult<()>;

    /// Check the session is alive
    fn ping(&self, session: CPtr) -> SrvResult<()>;

    /// Share a parameter buffer dataspace with the server
    fn set_param_buffer(&self, session: CPtr, dataspace: CPtr, size: usize) -> SrvResult<()>;

    /// Tear down the session
    fn disconnect_direct(&self, session: CPtr) -> SrvResult<()>;
}

/// Options for [`ServConnection::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Root name server
    pub name_root: CPtr,
    /// Our liveness capability, presented to servers on connect
    pub liveness: CPtr,
    /// Size of the parameter buffer to share; 0 for none
    pub param_buffer_size: usize,
    /// Servers that take requests on their anonymous endpoint without a
    /// session (the process server and root name server)
    pub connectionless: Vec<CPtr>,
}

impl ConnectOptions {
    pub fn new(name_root: CPtr, liveness: CPtr) -> Self {
        Self {
            name_root,
            liveness,
            param_buffer_size: 0,
            connectionless: Vec::new(),
        }
    }

    /// Share a parameter buffer of `size` bytes after connecting
    pub fn with_param_buffer(mut self, size: usize) -> Self {
        self.param_buffer_size = size;
        self
    }

    /// Treat `server` as connectionless
    pub fn with_connectionless(mut self, server: CPtr) -> Self {
        self.connectionless.push(server);
        self
    }
}

/// The session endpoint of a connection
#[derive(Debug)]
enum SessionCap {
    /// Requests go straight to the server's anonymous endpoint
    Connectionless(CPtr),
    Owned(CSlot),
}

/// Parameter buffer created by the client
#[derive(Debug)]
pub struct ClientParamBuffer {
    dataspace: CSlot,
    /// Our mapping of the buffer
    pub region: SharedRegion,
    pub size: usize,
}

impl ClientParamBuffer {
    /// Dataspace capability shared with the server
    pub fn dataspace(&self) -> CPtr {
        self.dataspace.cptr()
    }
}

/// An open connection to a server
#[derive(Debug)]
pub struct ServConnection {
    mount: MountPoint,
    session: SessionCap,
    param_buffer: Option<ClientParamBuffer>,
}

impl ServConnection {
    /// Resolve `path`, connect, ping, and optionally share a parameter
    /// buffer. Everything acquired is released again on failure.
    pub fn connect<R, C, P>(
        names: &R,
        serv: &C,
        procserv: &P,
        cs: &mut dyn CapSpace,
        opts: &ConnectOptions,
        path: &str,
    ) -> SrvResult<Self>
    where
        R: NameResolver + ?Sized,
        C: ServClient + ?Sized,
        P: ProcServ + ?Sized,
    {
        log::debug!("connect: connecting to [{}]", path);
        let mount = resolve_mount_point(names, opts.name_root, path)?;

        if opts.connectionless.contains(&mount.server) {
            log::debug!("connect: [{}] is connectionless", path);
            return Ok(Self {
                session: SessionCap::Connectionless(mount.server),
                mount,
                param_buffer: None,
            });
        }

        let session = cs.alloc_slot()?;
        if let Err(e) = serv.connect_direct(mount.server, opts.liveness, session.cptr()) {
            cs.free_slot(session);
            return Err(e);
        }

        if let Err(e) = serv.ping(session.cptr()) {
            abort_session(serv, cs, session);
            return Err(e);
        }

        let param_buffer = if opts.param_buffer_size > 0 {
            match open_param_buffer(serv, procserv, cs, session.cptr(), opts.param_buffer_size) {
                Ok(pb) => Some(pb),
                Err(e) => {
                    abort_session(serv, cs, session);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!("connect: connected to [{}]", path);
        Ok(Self {
            mount,
            session: SessionCap::Owned(session),
            param_buffer,
        })
    }

    /// Endpoint to send requests to
    pub fn session(&self) -> CPtr {
        match &self.session {
            SessionCap::Connectionless(ep) => *ep,
            SessionCap::Owned(slot) => slot.cptr(),
        }
    }

    /// Whether the server is connectionless
    pub fn is_connectionless(&self) -> bool {
        matches!(self.session, SessionCap::Connectionless(_))
    }

    /// Where the path resolved to
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount
    }

    /// The shared parameter buffer, if any
    pub fn param_buffer(&self) -> Option<&ClientParamBuffer> {
        self.param_buffer.as_ref()
    }

    /// Disconnect and release everything the connection holds
    pub fn disconnect<C: ServClient + ?Sized>(self, serv: &C, cs: &mut dyn CapSpace) -> SrvResult<()> {
        if let Some(pb) = self.param_buffer {
            release_logged(cs, pb.dataspace);
        }
        match self.session {
            SessionCap::Connectionless(_) => Ok(()),
            SessionCap::Owned(slot) => {
                let result = serv.disconnect_direct(slot.cptr());
                release_logged(cs, slot);
                result
            }
        }
    }
}

fn open_param_buffer<C, P>(
    serv: &C,
    procserv: &P,
    cs: &mut dyn CapSpace,
    session: CPtr,
    size: usize,
) -> SrvResult<ClientParamBuffer>
where
    C: ServClient + ?Sized,
    P: ProcServ + ?Sized,
{
    let dataspace = cs.alloc_slot()?;
    let region = match procserv.open_anon(size, dataspace.cptr()) {
        Ok(region) => region,
        Err(e) => {
            cs.free_slot(dataspace);
            return Err(e);
        }
    };
    if let Err(e) = serv.set_param_buffer(session, dataspace.cptr(), size) {
        release_logged(cs, dataspace);
        return Err(e);
    }
    Ok(ClientParamBuffer {
        dataspace,
        region,
        size,
    })
}

fn abort_session<C: ServClient + ?Sized>(serv: &C, cs: &mut dyn CapSpace, session: CSlot) {
    if let Err(e) = serv.disconnect_direct(session.cptr()) {
        log::warn!("connect: disconnect during unwind failed: {}", e);
    }
    release_logged(cs, session);
}

fn release_logged(cs: &mut dyn CapSpace, slot: CSlot) {
    let cptr = slot.cptr();
    if let Err(e) = cs.release_slot(slot) {
        log::warn!("connect: failed to release {}: {}", cptr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nameserv::NameDirectory;
    use alloc::boxed::Box;

    const ROOT: CPtr = CPtr(3);
    const DEV: CPtr = CPtr(20);
    const FS: CPtr = CPtr(30);

    fn directory() -> NameDirectory {
        let dir = NameDirectory::new();
        dir.add_server(ROOT, Box::new(|_| {})).unwrap();
        dir.add_server(DEV, Box::new(|_| {})).unwrap();
        dir.register(ROOT, "dev", DEV).unwrap();
        dir.register(ROOT, "fileserv", FS).unwrap();
        dir.register(DEV, "console", CPtr(40)).unwrap();
        dir
    }

    #[test]
    fn test_is_leaf() {
        assert!(is_leaf("readme"));
        assert!(is_leaf("/readme"));
        assert!(!is_leaf("/fileserv/readme"));
    }

    #[test]
    fn test_resolve_single_level() {
        let dir = directory();
        let mp = resolve_mount_point(&dir, ROOT, "/fileserv/readme").unwrap();
        assert_eq!(mp.server, FS);
        assert_eq!(mp.prefix, "/fileserv/");
        assert_eq!(mp.dataspace_name, "readme");
        assert_eq!(mp.name_root, ROOT);
    }

    #[test]
    fn test_resolve_nested() {
        let dir = directory();
        let mp = resolve_mount_point(&dir, ROOT, "/dev/console/tty0").unwrap();
        assert_eq!(mp.server, CPtr(40));
        assert_eq!(mp.prefix, "/dev/console/");
        assert_eq!(mp.dataspace_name, "tty0");
    }

    #[test]
    fn test_resolve_leaf_at_root() {
        let dir = directory();
        let mp = resolve_mount_point(&dir, ROOT, "/motd").unwrap();
        assert_eq!(mp.server, ROOT);
        assert_eq!(mp.prefix, "");
    }

    /// Forwards every path to the same endpoint with a fixed offset
    struct FixedForward(usize);

    impl NameResolver for FixedForward {
        fn register(&self, _ns_ep: CPtr, _path: &str, _endpoint: CPtr) -> SrvResult<()> {
            Err(SrvError::Unsupported)
        }

        fn unregister(&self, _ns_ep: CPtr, _path: &str) -> SrvResult<()> {
            Err(SrvError::Unsupported)
        }

        fn resolve_segment(&self, _ns_ep: CPtr, _path: &str) -> SrvResult<Resolution> {
            Ok(Resolution::Forward {
                endpoint: CPtr(9),
                consumed: self.0,
            })
        }
    }

    #[test]
    fn test_resolve_rejects_bad_offsets() {
        for consumed in [0, 5, 100] {
            assert_eq!(
                resolve_mount_point(&FixedForward(consumed), ROOT, "/a/b"),
                Err(SrvError::Malformed)
            );
        }
        // Offset 2 falls inside the two-byte 'é'
        assert_eq!(
            resolve_mount_point(&FixedForward(2), ROOT, "/é/b"),
            Err(SrvError::Malformed)
        );
    }

    #[test]
    fn test_resolve_unknown() {
        let dir = directory();
        assert_eq!(
            resolve_mount_point(&dir, ROOT, "/nope/x"),
            Err(SrvError::NotFound)
        );
    }
}
