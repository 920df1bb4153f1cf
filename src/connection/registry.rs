//! Connection Registry
//!
//! Owns every established connection, indexed by connection id and by
//! remote IID. Identity validation and reservation happen under the
//! allocator lock so concurrent handshakes can never be granted the same
//! IID. Deregistration notifies observers synchronously so that routes,
//! pending requests and streams scoped to a connection are gone before it
//! returns.

use super::{Connection, RegistryError};
use crate::identity::{IdentityError, Iid, IidAllocator, InstanceRole};
use crate::transport::{ConnectionId, FrameTx, LinkDirection};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Components that tear down per-connection state on close.
pub trait ConnectionObserver: Send + Sync {
    /// Called once, after the connection left the registry.
    fn connection_closed(&self, conn: &Connection);
}

/// Outcome of a successful registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    /// The remote's IID.
    pub iid: Iid,
    /// Whether the IID was freshly assigned rather than asserted or hinted.
    pub allocated: bool,
}

#[derive(Default)]
struct Maps {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_iid: HashMap<Iid, ConnectionId>,
}

/// Registry of established connections.
pub struct ConnectionRegistry {
    local_role: InstanceRole,
    local_iid: RwLock<Iid>,
    max_connections: usize,
    next_id: AtomicU64,
    maps: RwLock<Maps>,
    allocator: Mutex<IidAllocator>,
    observers: RwLock<Vec<Weak<dyn ConnectionObserver>>>,
}

impl ConnectionRegistry {
    /// Create a registry.
    ///
    /// A server's local IID is `server_iid`; other roles learn theirs at
    /// handshake via [`set_local_iid`](Self::set_local_iid).
    pub fn new(local_role: InstanceRole, server_iid: Iid, max_connections: usize) -> Self {
        Self::with_allocator(local_role, IidAllocator::new(server_iid), max_connections)
    }

    /// Create a registry around a prepared allocator.
    pub fn with_allocator(
        local_role: InstanceRole,
        allocator: IidAllocator,
        max_connections: usize,
    ) -> Self {
        let local_iid = if local_role.is_authority() {
            allocator.server_iid()
        } else {
            Iid::UNSET
        };
        Self {
            local_role,
            local_iid: RwLock::new(local_iid),
            max_connections,
            next_id: AtomicU64::new(1),
            maps: RwLock::new(Maps::default()),
            allocator: Mutex::new(allocator),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn local_role(&self) -> InstanceRole {
        self.local_role
    }

    /// This instance's IID (unset until a non-server has handshaken).
    pub fn local_iid(&self) -> Iid {
        *self.local_iid.read()
    }

    /// Adopt the IID assigned by a server.
    pub fn set_local_iid(&self, iid: Iid) {
        *self.local_iid.write() = iid;
    }

    /// Subscribe to connection closure.
    pub fn add_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Create a connection for a freshly opened link.
    ///
    /// The connection is addressable only after registration.
    pub fn open(
        &self,
        direction: LinkDirection,
        outbound: FrameTx,
        remote_addr: Option<String>,
    ) -> Arc<Connection> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(conn = %id, direction = %direction, "Connection opened");
        Arc::new(Connection::new(id, direction, outbound, remote_addr))
    }

    /// Register a connection under a remote-asserted IID.
    ///
    /// Used for server peers (static IIDs) and, on the dialing side, for
    /// the server that just acknowledged the handshake.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
        remote_iid: Iid,
        remote_role: InstanceRole,
    ) -> Result<Registration, RegistryError> {
        let mut allocator = self.allocator.lock();
        let mut maps = self.maps.write();

        if maps.by_id.len() >= self.max_connections {
            return Err(RegistryError::Full(self.max_connections));
        }
        let local = *self.local_iid.read();
        if remote_iid.is_unset() || remote_iid == local {
            return Err(RegistryError::InvalidIdentity {
                iid: remote_iid,
                role: remote_role,
            });
        }
        if maps.by_iid.contains_key(&remote_iid) {
            return Err(RegistryError::IdentityConflict(remote_iid));
        }
        if self.local_role.is_authority() {
            allocator
                .reserve(remote_iid, remote_role)
                .map_err(|e| match e {
                    IdentityError::AlreadyInUse(iid) => RegistryError::IdentityConflict(iid),
                    IdentityError::Invalid { iid, role } => {
                        RegistryError::InvalidIdentity { iid, role }
                    }
                    other => RegistryError::Identity(other),
                })?;
        }

        if let Err(e) = conn.establish(remote_iid, remote_role) {
            if self.local_role.is_authority() {
                let _ = allocator.release(remote_iid);
            }
            return Err(e);
        }
        maps.by_id.insert(conn.id(), conn.clone());
        maps.by_iid.insert(remote_iid, conn.id());

        info!(
            conn = %conn.id(),
            iid = %remote_iid,
            role = %remote_role,
            "Connection established"
        );
        Ok(Registration {
            iid: remote_iid,
            allocated: false,
        })
    }

    /// Register a connection, assigning the remote an IID.
    ///
    /// Server role only. A free `hint` is honoured; a hint held by a live
    /// connection is an identity conflict the peer recovers from by
    /// re-handshaking without it.
    pub fn register_allocating(
        &self,
        conn: &Arc<Connection>,
        hint: Option<Iid>,
        remote_role: InstanceRole,
    ) -> Result<Registration, RegistryError> {
        if !self.local_role.is_authority() {
            return Err(RegistryError::NotAuthority);
        }

        let mut allocator = self.allocator.lock();
        let mut maps = self.maps.write();

        if maps.by_id.len() >= self.max_connections {
            return Err(RegistryError::Full(self.max_connections));
        }
        let hint = hint.filter(|h| !h.is_unset());
        if let Some(hint) = hint {
            if allocator.is_allocated(hint) || maps.by_iid.contains_key(&hint) {
                return Err(RegistryError::IdentityConflict(hint));
            }
        }

        let iid = allocator.allocate(hint)?;
        if let Err(e) = conn.establish(iid, remote_role) {
            let _ = allocator.release(iid);
            return Err(e);
        }
        maps.by_id.insert(conn.id(), conn.clone());
        maps.by_iid.insert(iid, conn.id());

        let allocated = hint != Some(iid);
        info!(
            conn = %conn.id(),
            iid = %iid,
            role = %remote_role,
            allocated,
            "Connection established"
        );
        Ok(Registration { iid, allocated })
    }

    /// Look up the connection holding `iid`.
    pub fn lookup(&self, iid: Iid) -> Option<Arc<Connection>> {
        let maps = self.maps.read();
        let id = maps.by_iid.get(&iid)?;
        maps.by_id.get(id).cloned()
    }

    /// Look up a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.maps.read().by_id.get(&id).cloned()
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.maps.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every established connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self.maps.read().by_id.values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    /// Visit every established connection outside the registry lock.
    pub fn for_each_connection(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for conn in self.connections() {
            f(&conn);
        }
    }

    /// Remove a connection, release its IID and notify observers.
    ///
    /// Returns `None` if it was not registered (already removed).
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = {
            let mut maps = self.maps.write();
            let conn = maps.by_id.remove(&id)?;
            let iid = conn.remote_iid();
            if maps.by_iid.get(&iid) == Some(&id) {
                maps.by_iid.remove(&iid);
            }
            conn
        };
        conn.close();

        if self.local_role.is_authority() {
            let _ = self.allocator.lock().release(conn.remote_iid());
        }

        info!(conn = %id, iid = %conn.remote_iid(), "Connection closed");

        let observers: Vec<_> = {
            let mut observers = self.observers.write();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(|o| o.upgrade()).collect()
        };
        for observer in observers {
            observer.connection_closed(&conn);
        }
        Some(conn)
    }

    /// Deregister every connection.
    pub fn close_all(&self) -> Vec<Arc<Connection>> {
        let ids: Vec<_> = self.maps.read().by_id.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.deregister(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame_channel;
    use std::collections::HashSet;

    fn make_registry(role: InstanceRole) -> ConnectionRegistry {
        ConnectionRegistry::new(role, Iid::new(5), 64)
    }

    fn open(registry: &ConnectionRegistry) -> Arc<Connection> {
        let (tx, _rx) = frame_channel(8);
        registry.open(LinkDirection::Inbound, tx, None)
    }

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<(ConnectionId, Iid)>>,
    }

    impl ConnectionObserver for Recorder {
        fn connection_closed(&self, conn: &Connection) {
            self.closed.lock().push((conn.id(), conn.remote_iid()));
        }
    }

    #[test]
    fn test_server_allocates_and_honours_hint() {
        let registry = make_registry(InstanceRole::Server);
        assert_eq!(registry.local_iid(), Iid::new(5));

        let a = open(&registry);
        let reg = registry
            .register_allocating(&a, Some(Iid::new(1000)), InstanceRole::Agent)
            .unwrap();
        assert_eq!(reg.iid, Iid::new(1000));
        assert!(!reg.allocated);

        let b = open(&registry);
        let reg = registry.register_allocating(&b, None, InstanceRole::Viewer).unwrap();
        assert!(reg.allocated);
        assert_ne!(reg.iid, Iid::new(1000));
        assert_ne!(reg.iid, Iid::new(5));
        assert!(!reg.iid.is_unset());

        assert_eq!(registry.lookup(Iid::new(1000)).unwrap().id(), a.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_conflicting_hint_then_rehandshake() {
        let registry = make_registry(InstanceRole::Server);
        let a = open(&registry);
        registry
            .register_allocating(&a, Some(Iid::new(1000)), InstanceRole::Agent)
            .unwrap();

        let b = open(&registry);
        assert!(matches!(
            registry.register_allocating(&b, Some(Iid::new(1000)), InstanceRole::Agent),
            Err(RegistryError::IdentityConflict(iid)) if iid == Iid::new(1000)
        ));
        assert!(!b.is_established());

        // Peer drops its hint and retries on the same connection
        let reg = registry.register_allocating(&b, None, InstanceRole::Agent).unwrap();
        assert_ne!(reg.iid, Iid::new(1000));
    }

    #[test]
    fn test_server_iid_hint_is_replaced() {
        let registry = make_registry(InstanceRole::Server);
        let a = open(&registry);
        let reg = registry
            .register_allocating(&a, Some(Iid::new(5)), InstanceRole::Agent)
            .unwrap();
        assert_ne!(reg.iid, Iid::new(5));
        assert!(reg.allocated);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let registry = make_registry(InstanceRole::Server);
        let a = open(&registry);
        assert!(matches!(
            registry.register(&a, Iid::UNSET, InstanceRole::Server),
            Err(RegistryError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            registry.register(&a, Iid::new(5), InstanceRole::Server),
            Err(RegistryError::InvalidIdentity { .. })
        ));
        registry.register(&a, Iid::new(6), InstanceRole::Server).unwrap();
        assert!(matches!(
            registry.register(&a, Iid::new(7), InstanceRole::Server),
            Err(RegistryError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_non_server_cannot_allocate() {
        let registry = make_registry(InstanceRole::Agent);
        let a = open(&registry);
        assert!(matches!(
            registry.register_allocating(&a, None, InstanceRole::Viewer),
            Err(RegistryError::NotAuthority)
        ));
        registry.register(&a, Iid::new(5), InstanceRole::Server).unwrap();
    }

    #[test]
    fn test_limit() {
        let registry = ConnectionRegistry::new(InstanceRole::Server, Iid::new(5), 1);
        let a = open(&registry);
        registry.register_allocating(&a, None, InstanceRole::Agent).unwrap();
        let b = open(&registry);
        assert!(matches!(
            registry.register_allocating(&b, None, InstanceRole::Agent),
            Err(RegistryError::Full(1))
        ));
    }

    #[test]
    fn test_deregister_releases_and_notifies() {
        let registry = make_registry(InstanceRole::Server);
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&recorder) as Weak<dyn ConnectionObserver>;
        registry.add_observer(weak);

        let a = open(&registry);
        registry
            .register_allocating(&a, Some(Iid::new(1000)), InstanceRole::Agent)
            .unwrap();

        let removed = registry.deregister(a.id()).unwrap();
        assert!(removed.is_closed());
        assert!(registry.lookup(Iid::new(1000)).is_none());
        assert_eq!(recorder.closed.lock().as_slice(), &[(a.id(), Iid::new(1000))]);

        // Second deregister is a no-op and does not notify again
        assert!(registry.deregister(a.id()).is_none());
        assert_eq!(recorder.closed.lock().len(), 1);

        // Released IID can be handed out again
        let b = open(&registry);
        let reg = registry
            .register_allocating(&b, Some(Iid::new(1000)), InstanceRole::Agent)
            .unwrap();
        assert_eq!(reg.iid, Iid::new(1000));
    }

    #[test]
    fn test_concurrent_registration_unique_iids() {
        let registry = Arc::new(make_registry(InstanceRole::Server));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..8)
                        .map(|_| {
                            let conn = open(&registry);
                            registry
                                .register_allocating(&conn, None, InstanceRole::Agent)
                                .unwrap()
                                .iid
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for iid in h.join().unwrap() {
                assert!(seen.insert(iid), "duplicate IID {}", iid);
            }
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(registry.len(), 64);
    }

    #[test]
    fn test_for_each_connection() {
        let registry = make_registry(InstanceRole::Server);
        for _ in 0..3 {
            let c = open(&registry);
            registry.register_allocating(&c, None, InstanceRole::Agent).unwrap();
        }
        let mut count = 0;
        registry.for_each_connection(|_| count += 1);
        assert_eq!(count, 3);
        assert_eq!(registry.close_all().len(), 3);
        assert!(registry.is_empty());
    }
}
