//! Message dispatch, payload forwarding, and the disconnect cascade
//!
//! One router instance per process. Each inbound message, disconnect, or
//! timer firing runs to completion under the shared registry lock, so no
//! two events interleave on the same maps.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::messages::{IceServer, SignalMessage};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::registry::{normalize_remote_id, ConnectionIdentity, ConnectionRegistry, RegisterOutcome};
use crate::session::SessionBroker;
use crate::transport::{ConnId, Transport, CLOSE_BLOCKED, CLOSE_REPLACED};

/// Counters exposed to surrounding status endpoints
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub server_count: usize,
    pub active_session_count: usize,
    pub pending_session_count: usize,
    pub rate_limiter_stats: RateLimiterStats,
}

/// Routes inbound messages to registration, session, and forwarding logic
pub struct MessageRouter {
    registry: Arc<Mutex<ConnectionRegistry>>,
    broker: SessionBroker,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
}

impl MessageRouter {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        fallback_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new()));
        let broker = SessionBroker::new(registry.clone(), transport.clone(), fallback_timeout);
        Self {
            registry,
            broker,
            limiter,
            transport,
        }
    }

    /// Associate a source address with a connection for rate limiting.
    /// Connections without an address are simply not rate limited.
    pub fn set_client_address(&self, conn: ConnId, addr: String) {
        self.registry.lock().set_address(conn, addr);
    }

    /// Case-insensitive registration check
    pub fn is_online(&self, remote_id: &str) -> bool {
        self.registry.lock().is_online(remote_id)
    }

    pub fn stats(&self) -> Stats {
        let registry = self.registry.lock();
        Stats {
            server_count: registry.server_count(),
            active_session_count: registry.session_count(),
            pending_session_count: registry.pending_count(),
            rate_limiter_stats: self.limiter.stats(),
        }
    }

    /// Handle one inbound message from a connection
    pub fn handle_message(&self, conn: ConnId, msg: SignalMessage) {
        if let Some(addr) = self.address_of(conn) {
            if let Err(retry) = self.limiter.check(&addr) {
                self.transport.send(
                    conn,
                    &SignalMessage::error(SignalError::RateLimited(retry.as_secs()).to_string()),
                );
                self.transport.close(conn, CLOSE_BLOCKED, "rate limit exceeded");
                return;
            }
        }

        let result = match msg {
            SignalMessage::Ping => {
                self.transport.send(conn, &SignalMessage::Pong);
                Ok(())
            }
            SignalMessage::Pong => Ok(()),
            SignalMessage::RegisterServer {
                remote_id,
                ice_servers,
            } => self.handle_register(conn, remote_id, ice_servers),
            SignalMessage::ConnectRequest { remote_id } => self.handle_connect(conn, remote_id),
            SignalMessage::SessionReady {
                session_id,
                ice_servers,
            } => self.handle_session_ready(conn, session_id, ice_servers),
            msg @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }) => self.forward(conn, msg),
            other => {
                warn!("unexpected inbound message on #{}: {:?}", conn, other);
                Err(SignalError::UnexpectedMessage)
            }
        };

        if let Err(e) = result {
            debug!("rejected message from #{}: {}", conn, e);
            self.transport.send(conn, &SignalMessage::error(e.to_string()));
        }
    }

    fn handle_register(
        &self,
        conn: ConnId,
        remote_id: Option<String>,
        ice_servers: Option<Vec<IceServer>>,
    ) -> Result<(), SignalError> {
        let remote_id = remote_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(SignalError::MissingRemoteId)?;
        let remote_id = normalize_remote_id(&remote_id);

        let mut registry = self.registry.lock();
        let outcome = registry.register_server(conn, &remote_id, ice_servers);

        match &outcome {
            RegisterOutcome::Refreshed => {
                debug!("{} refreshed by #{}", remote_id, conn);
            }
            RegisterOutcome::Installed { evicted, released } => {
                if let Some(old) = evicted {
                    // Sessions die with the registration they were built on
                    self.teardown_remote_sessions(&mut registry, &remote_id);
                    info!("{} re-registered, closing previous connection #{}", remote_id, old);
                    self.transport
                        .close(*old, CLOSE_REPLACED, "replaced by new connection");
                } else {
                    info!("{} registered by #{}", remote_id, conn);
                }
                if let Some(old_id) = released {
                    self.teardown_remote_sessions(&mut registry, old_id);
                    debug!("{} released by #{}", old_id, conn);
                }
            }
        }

        self.transport
            .send(conn, &SignalMessage::Registered { remote_id });
        Ok(())
    }

    /// Notify and remove every session, active or pending, bound to a
    /// remote id whose registration is going away
    fn teardown_remote_sessions(&self, registry: &mut ConnectionRegistry, remote_id: &str) {
        for session_id in registry.session_ids_for(remote_id) {
            if let Some(session) = registry.remove_session(&session_id) {
                self.transport
                    .send(session.conn, &SignalMessage::PeerDisconnected { session_id });
            }
        }
        for session_id in registry.pending_ids_for(remote_id) {
            if let Some(pending) = registry.take_pending(&session_id) {
                pending.timer.abort();
                self.transport.send(
                    pending.conn,
                    &SignalMessage::error(SignalError::ServerDisconnected.to_string()),
                );
            }
        }
    }

    fn handle_connect(
        &self,
        conn: ConnId,
        remote_id: Option<String>,
    ) -> Result<(), SignalError> {
        let remote_id = remote_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(SignalError::MissingRemoteId)?;
        let remote_id = normalize_remote_id(&remote_id);

        match self.broker.begin_connect(conn, &remote_id) {
            Ok(session_id) => {
                info!("connect #{} -> {} as session {}", conn, remote_id, session_id);
                Ok(())
            }
            Err(SignalError::ServerNotFound) => {
                // Brute-force signal: count the miss before replying
                if let Some(addr) = self.address_of(conn) {
                    if let Some(retry) = self.limiter.record_failed_lookup(&addr) {
                        self.transport.send(
                            conn,
                            &SignalMessage::error(SignalError::ServerNotFound.to_string()),
                        );
                        self.transport.close(
                            conn,
                            CLOSE_BLOCKED,
                            &format!("too many failed lookups, retry in {}s", retry.as_secs()),
                        );
                        return Ok(());
                    }
                }
                Err(SignalError::ServerNotFound)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_session_ready(
        &self,
        conn: ConnId,
        session_id: Option<String>,
        ice_servers: Option<Vec<IceServer>>,
    ) -> Result<(), SignalError> {
        let session_id = session_id.ok_or(SignalError::MissingSessionId)?;
        self.broker
            .complete_with_fresh_ice(conn, &session_id, ice_servers.unwrap_or_default())?;
        Ok(())
    }

    /// Forward an opaque payload across a session
    ///
    /// Direction is asymmetric by design: a client's messages follow its
    /// own identity (a client-supplied sessionId is never trusted), while
    /// a server speaks to many sessions and must address one explicitly.
    fn forward(&self, conn: ConnId, msg: SignalMessage) -> Result<(), SignalError> {
        let registry = self.registry.lock();

        let identity = registry.identity(conn).ok_or(SignalError::NotRegistered)?;
        match identity {
            ConnectionIdentity::Client(session_id) => {
                let session = registry
                    .session(session_id)
                    .ok_or(SignalError::SessionNotFound)?;
                let server = registry
                    .lookup_server(&session.remote_id)
                    .ok_or(SignalError::ServerDisconnected)?;
                let stamped = msg.with_session_id(session_id);
                self.transport.send(server.conn, &stamped);
            }
            ConnectionIdentity::Server(_) => {
                let session_id = msg.session_id().ok_or(SignalError::MissingSessionId)?;
                let session = registry
                    .session(session_id)
                    .ok_or(SignalError::ClientNotFound)?;
                self.transport.send(session.conn, &msg);
            }
        }
        Ok(())
    }

    /// Single entry point for transport-level disconnects
    pub fn handle_disconnect(&self, conn: ConnId) {
        let mut registry = self.registry.lock();
        registry.remove_address(conn);

        let Some(identity) = registry.remove_identity(conn) else {
            debug!("connection #{} closed without identity", conn);
            return;
        };

        match identity {
            ConnectionIdentity::Server(remote_id) => {
                if !registry.remove_server_if_owner(conn, &remote_id) {
                    // Already replaced by a newer registration; nothing
                    // else belongs to this connection
                    debug!("stale disconnect for {} from #{}", remote_id, conn);
                    return;
                }

                self.teardown_remote_sessions(&mut registry, &remote_id);
                info!("{} disconnected, sessions torn down", remote_id);
            }
            ConnectionIdentity::Client(session_id) => {
                if let Some(pending) = registry.take_pending(&session_id) {
                    pending.timer.abort();
                    debug!("pending session {} discarded", session_id);
                } else if let Some(session) = registry.remove_session(&session_id) {
                    if let Some(server) = registry.lookup_server(&session.remote_id) {
                        self.transport.send(
                            server.conn,
                            &SignalMessage::ClientDisconnected { session_id },
                        );
                    }
                }
            }
        }
    }

    fn address_of(&self, conn: ConnId) -> Option<String> {
        self.registry.lock().address(conn).cloned()
    }
}
