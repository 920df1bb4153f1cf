//! IID Allocator
//!
//! Run by the server role. Tracks the IIDs held by live connections and
//! hands out fresh ones on handshake.
//!
//! ## Design
//!
//! - A hinted IID (remembered by a reconnecting peer) is honoured when it
//!   is valid and free
//! - Otherwise a counter seeded from a random value is incremented until a
//!   free IID is found, so assignments are not trivially predictable
//! - 0 and the server's own IID are never handed out

use super::{IdentityError, Iid, InstanceRole};
use rand::Rng;
use std::collections::HashSet;

/// Allocator for instance identifiers.
///
/// Not internally synchronized; the connection registry owns it behind a
/// lock so that validation and reservation happen atomically.
#[derive(Debug)]
pub struct IidAllocator {
    /// This server's own statically configured IID.
    server_iid: Iid,
    /// IIDs currently held by established connections.
    in_use: HashSet<u32>,
    /// Next counter value to try.
    next: u32,
    /// Maximum candidates examined before giving up.
    max_attempts: usize,
}

impl IidAllocator {
    /// Create an allocator with a randomly seeded counter.
    pub fn new(server_iid: Iid) -> Self {
        let seed = rand::rng().random::<u32>();
        Self::with_seed(server_iid, seed)
    }

    /// Create an allocator with an explicit counter seed.
    pub fn with_seed(server_iid: Iid, seed: u32) -> Self {
        Self {
            server_iid,
            in_use: HashSet::new(),
            next: seed,
            max_attempts: 1 << 16,
        }
    }

    /// Set the maximum number of candidates examined per allocation.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The server IID this allocator never hands out.
    pub fn server_iid(&self) -> Iid {
        self.server_iid
    }

    /// Allocate an IID, preferring `hint` when it is valid and unused.
    ///
    /// The returned IID is reserved until [`release`](Self::release).
    pub fn allocate(&mut self, hint: Option<Iid>) -> Result<Iid, IdentityError> {
        if let Some(hint) = hint {
            if self.validate(hint, InstanceRole::Agent) {
                self.in_use.insert(hint.as_u32());
                return Ok(hint);
            }
        }

        for _ in 0..self.max_attempts {
            let candidate = Iid::new(self.next);
            self.next = self.next.wrapping_add(1);
            if self.validate(candidate, InstanceRole::Agent) {
                self.in_use.insert(candidate.as_u32());
                return Ok(candidate);
            }
        }

        Err(IdentityError::Exhausted)
    }

    /// Check whether a peer may hold `iid` in the given role.
    ///
    /// Rejects the reserved zero value, any IID already held by a live
    /// connection, and the server's own IID unless the peer is a server.
    pub fn validate(&self, iid: Iid, role: InstanceRole) -> bool {
        if iid.is_unset() || self.in_use.contains(&iid.as_u32()) {
            return false;
        }
        role == InstanceRole::Server || iid != self.server_iid
    }

    /// Reserve a peer-asserted IID after validating it.
    pub fn reserve(&mut self, iid: Iid, role: InstanceRole) -> Result<(), IdentityError> {
        if self.in_use.contains(&iid.as_u32()) {
            return Err(IdentityError::AlreadyInUse(iid));
        }
        if !self.validate(iid, role) {
            return Err(IdentityError::Invalid { iid, role });
        }
        self.in_use.insert(iid.as_u32());
        Ok(())
    }

    /// Return an IID to the pool.
    pub fn release(&mut self, iid: Iid) -> Result<(), IdentityError> {
        if self.in_use.remove(&iid.as_u32()) {
            Ok(())
        } else {
            Err(IdentityError::NotFound(iid))
        }
    }

    /// Check if an IID is currently held.
    pub fn is_allocated(&self, iid: Iid) -> bool {
        self.in_use.contains(&iid.as_u32())
    }

    /// Number of IIDs currently held.
    pub fn count(&self) -> usize {
        self.in_use.len()
    }

    /// Check if no IIDs are held.
    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
