//! Link handshake.
//!
//! The dialing side sends a `Handshake` with its role, its IID hint (or
//! static IID for servers) and an optional credential. The accepting
//! server validates or assigns an IID and answers with a `HandshakeAck`.
//! An identity conflict is answered without closing the link so the
//! dialer can retry without a hint.

use super::{Instance, InstanceError};
use crate::connection::{Connection, RegistryError};
use crate::identity::{store_iid, IdentityError, Iid, InstanceRole};
use crate::protocol::{
    Disconnect, DisconnectReason, Handshake, HandshakeAck, HandshakeStatus, LinkMessage,
};
use crate::transport::FrameRx;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handshake rounds a server grants one link.
const MAX_HANDSHAKE_ATTEMPTS: usize = 3;

/// Outcome of a completed outbound handshake.
pub(super) struct OutboundHandshake {
    pub ack: HandshakeAck,
    /// Frames that arrived before the ack, to be processed in order.
    pub early: Vec<Vec<u8>>,
}

impl Instance {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.node.liveness.handshake_timeout_secs)
    }

    fn reject(&self, conn: &Connection, status: HandshakeStatus) {
        let ack = HandshakeAck::rejected(status, self.local_iid(), self.role());
        let _ = conn.send(ack.encode());
    }

    /// Wait for the next frame within the handshake timeout.
    async fn next_handshake_frame(&self, rx: &mut FrameRx) -> Result<Vec<u8>, InstanceError> {
        let timeout = self.handshake_timeout();
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(InstanceError::LinkClosed),
            Err(_) => Err(InstanceError::HandshakeTimeout(timeout)),
        }
    }

    // === Accepting side ===

    /// Run the server side of the handshake on a fresh link.
    pub(super) async fn handshake_inbound(
        &self,
        conn: &Arc<Connection>,
        rx: &mut FrameRx,
    ) -> Result<(), InstanceError> {
        if !self.role().is_authority() {
            self.reject(conn, HandshakeStatus::RoleRejected);
            return Err(InstanceError::HandshakeRejected(HandshakeStatus::RoleRejected));
        }

        for _ in 0..MAX_HANDSHAKE_ATTEMPTS {
            let frame = self.next_handshake_frame(rx).await?;
            let hello = match LinkMessage::decode(&frame)? {
                LinkMessage::Handshake(hello) => hello,
                LinkMessage::Disconnect(d) => {
                    debug!(conn = %conn.id(), reason = %d.reason, "Peer gave up during handshake");
                    return Err(InstanceError::LinkClosed);
                }
                other => {
                    let bye = Disconnect::new(DisconnectReason::HandshakeFailed);
                    let _ = conn.send(bye.encode());
                    return Err(InstanceError::UnexpectedFrame(other.msg_type().to_string()));
                }
            };

            let authenticated = hello
                .credential
                .as_ref()
                .is_some_and(|c| self.config.node.auth.credentials.contains(c));
            if hello.credential.is_some() && !authenticated {
                warn!(
                    conn = %conn.id(),
                    role = %hello.role,
                    "Credential not accepted, continuing unauthenticated"
                );
            }

            let registered = if hello.role.is_authority() {
                self.registry.register(conn, hello.iid, hello.role)
            } else {
                let hint = Some(hello.iid).filter(|iid| !iid.is_unset());
                self.registry.register_allocating(conn, hint, hello.role)
            };

            let status = match registered {
                Ok(registration) => {
                    conn.set_credential(hello.credential.as_deref(), authenticated);
                    let ack = HandshakeAck::accepted(
                        registration.iid,
                        self.local_iid(),
                        self.role(),
                        authenticated,
                    );
                    if let Err(e) = conn.send(ack.encode()) {
                        self.registry.deregister(conn.id());
                        debug!(conn = %conn.id(), error = %e, "Failed to send handshake ack");
                        return Err(InstanceError::LinkClosed);
                    }
                    info!(
                        conn = %conn.id(),
                        iid = %registration.iid,
                        role = %hello.role,
                        allocated = registration.allocated,
                        authenticated,
                        "Peer admitted"
                    );
                    return Ok(());
                }
                Err(RegistryError::IdentityConflict(iid)) => {
                    debug!(conn = %conn.id(), iid = %iid, "Identity conflict, awaiting retry");
                    self.reject(conn, HandshakeStatus::IdentityConflict);
                    continue;
                }
                Err(RegistryError::InvalidIdentity { iid, role }) => {
                    debug!(conn = %conn.id(), iid = %iid, role = %role, "Invalid identity");
                    HandshakeStatus::IdentityConflict
                }
                Err(RegistryError::Full(max)) => {
                    warn!(conn = %conn.id(), max, "Connection limit reached, rejecting peer");
                    HandshakeStatus::Full
                }
                Err(RegistryError::Identity(IdentityError::Exhausted)) => {
                    warn!(conn = %conn.id(), "IID space exhausted, rejecting peer");
                    HandshakeStatus::Exhausted
                }
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "Registration failed");
                    HandshakeStatus::RoleRejected
                }
            };
            self.reject(conn, status);
            return Err(InstanceError::HandshakeRejected(status));
        }

        let _ = conn.send(Disconnect::new(DisconnectReason::HandshakeFailed).encode());
        Err(InstanceError::HandshakeRejected(HandshakeStatus::IdentityConflict))
    }

    // === Dialing side ===

    /// Run the dialer side of the handshake and register the server.
    pub(super) async fn handshake_outbound(
        &self,
        conn: &Arc<Connection>,
        rx: &mut FrameRx,
    ) -> Result<OutboundHandshake, InstanceError> {
        let mut hint = if self.role().is_authority() {
            self.local_iid()
        } else {
            self.iid_hint.lock().unwrap_or(Iid::UNSET)
        };
        let mut early = Vec::new();

        loop {
            let mut hello = Handshake::new(self.role(), hint);
            if let Some(credential) = &self.config.node.identity.credential {
                hello = hello.with_credential(credential.clone());
            }
            conn.send(hello.encode()).map_err(|_| InstanceError::LinkClosed)?;

            let ack = loop {
                let frame = self.next_handshake_frame(rx).await?;
                match LinkMessage::decode(&frame)? {
                    LinkMessage::HandshakeAck(ack) => break ack,
                    LinkMessage::Disconnect(d) => {
                        debug!(
                            conn = %conn.id(),
                            reason = %d.reason,
                            "Server closed during handshake"
                        );
                        return Err(InstanceError::LinkClosed);
                    }
                    _ => early.push(frame),
                }
            };

            match ack.status {
                HandshakeStatus::Accepted => {}
                HandshakeStatus::IdentityConflict
                    if !hint.is_unset() && !self.role().is_authority() =>
                {
                    info!(conn = %conn.id(), hint = %hint, "IID hint in use, retrying without it");
                    hint = Iid::UNSET;
                    *self.iid_hint.lock() = None;
                    continue;
                }
                status => return Err(InstanceError::HandshakeRejected(status)),
            }

            if !self.role().is_authority() {
                self.adopt_iid(ack.assigned);
            }
            self.registry.register(conn, ack.responder, ack.role)?;
            // Servers are trusted by the instances that dial them.
            conn.set_credential(None, ack.role == InstanceRole::Server);
            info!(
                conn = %conn.id(),
                server = %ack.responder,
                iid = %self.local_iid(),
                authenticated = ack.authenticated,
                "Handshake complete"
            );
            return Ok(OutboundHandshake { ack, early });
        }
    }

    /// Take the IID a server assigned, persisting it if configured.
    fn adopt_iid(&self, iid: Iid) {
        let previous = self.local_iid();
        self.registry.set_local_iid(iid);
        *self.iid_hint.lock() = Some(iid);
        if previous != iid {
            info!(previous = %previous, iid = %iid, "Adopted assigned IID");
        }
        if let Some(path) = &self.config.node.identity.iid_file {
            if previous == iid && path.exists() {
                return;
            }
            if let Err(e) = store_iid(path, iid) {
                warn!(path = %path.display(), error = %e, "Failed to persist IID");
            }
        }
    }
}
