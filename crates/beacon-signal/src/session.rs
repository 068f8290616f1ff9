//! Session lifecycle: pending connects, fresh-ICE completion, fallback
//!
//! A connect attempt sits in the pending map until either the target
//! server answers with fresh ICE servers or a 10-second deadline fires and
//! promotes it with the ICE servers cached at request time. Exactly one of
//! the two paths wins: both go through `take_pending` under the shared
//! registry lock, and the loser sees an empty slot and does nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::SignalError;
use crate::messages::{IceServer, SignalMessage};
use crate::registry::{ClientSession, ConnectionIdentity, ConnectionRegistry, PendingSession};
use crate::transport::{ConnId, Transport};

/// Session id length in characters
pub const SESSION_ID_LENGTH: usize = 16;

const SESSION_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random mixed-case alphanumeric session id
///
/// Uniqueness is not checked: with 62^16 possible ids a collision is
/// treated as practically impossible.
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
pub fn generate_session_id() -> String {
    let mut id = String::with_capacity(SESSION_ID_LENGTH);
    while id.len() < SESSION_ID_LENGTH {
        let mut bytes = [0u8; SESSION_ID_LENGTH];
        getrandom::getrandom(&mut bytes).expect("RNG failed - system entropy source unavailable");
        id.extend(bytes.iter().filter_map(|&b| id_char(b)));
    }
    id.truncate(SESSION_ID_LENGTH);
    id
}

/// Map a random byte onto the alphabet. 256 is not a multiple of 62, so
/// bytes past the last full multiple are rejected to keep every character
/// equally likely.
fn id_char(byte: u8) -> Option<char> {
    let alphabet = SESSION_ID_CHARS.len() as u8;
    let limit = u8::MAX - (u8::MAX % alphabet);
    (byte < limit).then(|| SESSION_ID_CHARS[(byte % alphabet) as usize] as char)
}

/// Outcome of a `session-ready` completion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Pending session promoted with the fresh ICE servers
    Completed,
    /// Session was no longer pending (fallback already fired, or the
    /// client vanished); a normal outcome, not an error
    Ignored,
}

/// Owns the pending-to-active transition
#[derive(Clone)]
pub struct SessionBroker {
    registry: Arc<Mutex<ConnectionRegistry>>,
    transport: Arc<dyn Transport>,
    fallback_timeout: Duration,
}

impl SessionBroker {
    pub fn new(
        registry: Arc<Mutex<ConnectionRegistry>>,
        transport: Arc<dyn Transport>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            fallback_timeout,
        }
    }

    /// Start a connect attempt from a client to a registered server
    ///
    /// Arms the one-shot fallback timer and tells the server connection to
    /// prepare fresh ICE servers for the new session id. The caller is
    /// responsible for feeding a `ServerNotFound` into abuse tracking.
    pub fn begin_connect(&self, conn: ConnId, remote_id: &str) -> Result<String, SignalError> {
        let mut registry = self.registry.lock();

        let server = registry
            .lookup_server(remote_id)
            .ok_or(SignalError::ServerNotFound)?;
        let server_conn = server.conn;
        let fallback_ice = server.ice_servers.clone().unwrap_or_default();

        // A repeat connect from the same connection abandons its previous
        // attempt; a session must not outlive its client's identity
        if let Some(ConnectionIdentity::Client(previous)) = registry.identity(conn).cloned() {
            if let Some(pending) = registry.take_pending(&previous) {
                pending.timer.abort();
            }
            registry.remove_session(&previous);
            debug!("session {} abandoned by reconnecting client", previous);
        }

        let session_id = generate_session_id();
        // Arm the deadline in the same critical section that records the
        // pending session; the spawned task only awaits it
        let deadline = tokio::time::sleep(self.fallback_timeout);
        let timer = tokio::spawn({
            let broker = self.clone();
            let session_id = session_id.clone();
            async move {
                deadline.await;
                broker.complete_with_fallback(&session_id);
            }
        });

        registry.insert_pending(PendingSession {
            session_id: session_id.clone(),
            remote_id: remote_id.to_string(),
            conn,
            fallback_ice,
            timer,
        });
        registry.set_identity(conn, ConnectionIdentity::Client(session_id.clone()));

        debug!("session {} pending for {}", session_id, remote_id);
        self.transport.send(
            server_conn,
            &SignalMessage::ClientConnected {
                session_id: session_id.clone(),
            },
        );

        Ok(session_id)
    }

    /// Promote a pending session with fresh ICE servers from its server
    pub fn complete_with_fresh_ice(
        &self,
        conn: ConnId,
        session_id: &str,
        ice_servers: Vec<IceServer>,
    ) -> Result<Completion, SignalError> {
        let mut registry = self.registry.lock();

        match registry.identity(conn) {
            Some(ConnectionIdentity::Server(_)) => {}
            _ => return Err(SignalError::NotAServer),
        }

        let Some(pending) = registry.take_pending(session_id) else {
            debug!("session {} no longer pending, ignoring", session_id);
            return Ok(Completion::Ignored);
        };
        // Cancel the fallback in the same critical section that cleared the
        // pending slot; a late firing finds nothing to promote
        pending.timer.abort();

        let client_conn = pending.conn;
        // Pair with the remote id recorded at connect time, never one taken
        // from the message
        registry.insert_session(ClientSession {
            session_id: pending.session_id,
            remote_id: pending.remote_id,
            conn: client_conn,
        });

        info!("session {} active (fresh ICE servers)", session_id);
        self.transport.send(
            client_conn,
            &SignalMessage::Connected {
                session_id: session_id.to_string(),
                ice_servers,
            },
        );

        Ok(Completion::Completed)
    }

    /// Deadline path: promote with the ICE servers cached at request time
    fn complete_with_fallback(&self, session_id: &str) {
        let mut registry = self.registry.lock();

        let Some(pending) = registry.take_pending(session_id) else {
            return;
        };

        let client_conn = pending.conn;
        let ice_servers = pending.fallback_ice;
        registry.insert_session(ClientSession {
            session_id: pending.session_id,
            remote_id: pending.remote_id,
            conn: client_conn,
        });

        info!("session {} active (fallback to cached ICE servers)", session_id);
        self.transport.send(
            client_conn,
            &SignalMessage::Connected {
                session_id: session_id.to_string(),
                ice_servers,
            },
        );
    }

    /// Drop a session from whichever map holds it; idempotent
    pub fn end_session(&self, session_id: &str) {
        let mut registry = self.registry.lock();
        if let Some(pending) = registry.take_pending(session_id) {
            pending.timer.abort();
        }
        registry.remove_session(session_id);
    }
}
