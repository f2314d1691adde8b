//! Name service
//!
//! Servers publish their anonymous endpoint under a name; clients walk a
//! path one segment at a time, each segment naming the next name server or
//! the leaf server. The namespace is distributed: every server may run a
//! [`NameServ`] for the prefix it owns.
//!
//! Path resolution in a single name server:
//!
//! ```text
//! "/fileserv/docs/readme"  ->  Forward { endpoint: <fileserv>, consumed: 9 }
//! "readme"                 ->  Local
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{SrvError, SrvResult};
use crate::types::CPtr;

/// Callback releasing an endpoint capability owned by a name server
pub type FreeCapFn = Box<dyn FnMut(CPtr) + Send>;

/// Result of resolving a path against one name server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The remaining path is a leaf owned by this server
    Local,
    /// The first segment names `endpoint`; `consumed` bytes of the path were
    /// resolved, up to but excluding the following `/`
    Forward { endpoint: CPtr, consumed: usize },
}

// ============================================================================
// Name server state
// ============================================================================

/// A registered name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    pub endpoint: CPtr,
}

/// The registration list of one name server
pub struct NameServ {
    entries: Vec<NameEntry>,
    free_cap: FreeCapFn,
}

impl NameServ {
    /// Create an empty name server. Endpoints dropped from the list are
    /// released through `free_cap`.
    pub fn new(free_cap: FreeCapFn) -> Self {
        Self {
            entries: Vec::new(),
            free_cap,
        }
    }

    /// Register `endpoint` under `name`, replacing any existing registration
    pub fn add(&mut self, name: &str, endpoint: CPtr) -> SrvResult<()> {
        if name.is_empty() || endpoint.is_null() {
            return Err(SrvError::InvalidArgument);
        }
        if self.lookup(name).is_some() {
            self.delete(name)?;
        }
        log::debug!("nameserv: registering [{}] -> {}", name, endpoint);
        self.entries.push(NameEntry {
            name: name.to_string(),
            endpoint,
        });
        Ok(())
    }

    /// Remove a registration, releasing its endpoint
    pub fn delete(&mut self, name: &str) -> SrvResult<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(SrvError::NotFound)?;
        let entry = self.entries.remove(idx);
        (self.free_cap)(entry.endpoint);
        Ok(())
    }

    /// Endpoint registered under `name`
    pub fn lookup(&self, name: &str) -> Option<CPtr> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.endpoint)
    }

    /// Resolve the first segment of `path`. An empty path names nothing.
    pub fn resolve(&self, path: &str) -> SrvResult<Resolution> {
        let skip = usize::from(path.starts_with('/'));
        let rest = &path[skip..];
        if rest.is_empty() {
            return Err(SrvError::NotFound);
        }
        let Some(seg_len) = rest.find('/') else {
            return Ok(Resolution::Local);
        };
        let endpoint = self.lookup(&rest[..seg_len]).ok_or(SrvError::NotFound)?;
        Ok(Resolution::Forward {
            endpoint,
            consumed: skip + seg_len,
        })
    }

    /// Registered entries in registration order
    pub fn entries(&self) -> &[NameEntry] {
        &self.entries
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every registered endpoint and drop the list
    pub fn release(self) {}
}

impl Drop for NameServ {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            (self.free_cap)(entry.endpoint);
        }
    }
}

impl core::fmt::Debug for NameServ {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NameServ").field("entries", &self.entries).finish()
    }
}

// ============================================================================
// Resolver contract
// ============================================================================

/// Name server calls, addressed by the name server's endpoint
pub trait NameResolver {
    /// Register `endpoint` under `path` with the name server at `ns_ep`
    fn register(&self, ns_ep: CPtr, path: &str, endpoint: CPtr) -> SrvResult<()>;

    /// Remove `path` from the name server at `ns_ep`
    fn unregister(&self, ns_ep: CPtr, path: &str) -> SrvResult<()>;

    /// Resolve the first segment of `path` at the name server `ns_ep`
    fn resolve_segment(&self, ns_ep: CPtr, path: &str) -> SrvResult<Resolution>;
}

/// In-process directory of name servers keyed by their endpoint
#[derive(Default)]
pub struct NameDirectory {
    servers: Mutex<BTreeMap<CPtr, NameServ>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a name server reachable at `ns_ep`
    pub fn add_server(&self, ns_ep: CPtr, free_cap: FreeCapFn) -> SrvResult<()> {
        let mut servers = self.servers.lock();
        if servers.contains_key(&ns_ep) {
            return Err(SrvError::InvalidArgument);
        }
        servers.insert(ns_ep, NameServ::new(free_cap));
        Ok(())
    }

    /// Stop the name server at `ns_ep`, releasing its registrations
    pub fn remove_server(&self, ns_ep: CPtr) -> SrvResult<()> {
        let removed = self.servers.lock().remove(&ns_ep);
        removed.map(NameServ::release).ok_or(SrvError::NotFound)
    }

    /// Endpoint registered under `name` at `ns_ep`
    pub fn lookup(&self, ns_ep: CPtr, name: &str) -> Option<CPtr> {
        self.servers.lock().get(&ns_ep).and_then(|ns| ns.lookup(name))
    }
}

impl NameResolver for NameDirectory {
    fn register(&self, ns_ep: CPtr, path: &str, endpoint: CPtr) -> SrvResult<()> {
        let name = path.strip_prefix('/').unwrap_or(path);
        self.servers
            .lock()
            .get_mut(&ns_ep)
            .ok_or(SrvError::NotFound)?
            .add(name, endpoint)
    }

    fn unregister(&self, ns_ep: CPtr, path: &str) -> SrvResult<()> {
        let name = path.strip_prefix('/').unwrap_or(path);
        self.servers
            .lock()
            .get_mut(&ns_ep)
            .ok_or(SrvError::NotFound)?
            .delete(name)
    }

    fn resolve_segment(&self, ns_ep: CPtr, path: &str) -> SrvResult<Resolution> {
        self.servers
            .lock()
            .get(&ns_ep)
            .ok_or(SrvError::NotFound)?
            .resolve(path)
    }
}
