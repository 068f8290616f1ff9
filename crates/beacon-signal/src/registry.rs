//! Connection registry: the authoritative in-memory maps
//!
//! Holds registered servers by remote id, pending and active sessions by
//! session id, and the reverse connection-to-identity map. The registry is
//! plain data with no lock of its own; callers hold the engine mutex across
//! every mutation, so each inbound event observes and leaves a consistent
//! state.

use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::messages::IceServer;
use crate::transport::ConnId;

/// A live server registration under a remote id
#[derive(Debug)]
pub struct ServerRegistration {
    pub remote_id: String,
    pub conn: ConnId,
    /// ICE servers announced at registration time; snapshot used as the
    /// fallback when the server does not answer a connect in time
    pub ice_servers: Option<Vec<IceServer>>,
}

/// A connect attempt waiting for fresh ICE servers or the fallback deadline
#[derive(Debug)]
pub struct PendingSession {
    pub session_id: String,
    pub remote_id: String,
    pub conn: ConnId,
    /// ICE servers cached from the registration at connect-request time
    pub fallback_ice: Vec<IceServer>,
    /// One-shot fallback timer; aborted on promotion or discard
    pub timer: JoinHandle<()>,
}

/// An established client-server pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub session_id: String,
    pub remote_id: String,
    pub conn: ConnId,
}

/// What a connection is, resolved when a forwarded message arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionIdentity {
    /// Registered server, carries its remote id
    Server(String),
    /// Client, carries its session id
    Client(String),
}

/// Outcome of a registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Same connection re-registered; ICE servers refreshed in place
    Refreshed,
    /// New registration installed. `evicted` holds the connection that
    /// previously owned the remote id, which the caller must close;
    /// `released` holds the remote id this connection registered under
    /// before, whose sessions the caller must tear down.
    Installed {
        evicted: Option<ConnId>,
        released: Option<String>,
    },
}

/// Canonicalize a remote id (trim, uppercase)
pub fn normalize_remote_id(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}

/// In-memory signaling state, exclusively owned by the core
#[derive(Default)]
pub struct ConnectionRegistry {
    servers: HashMap<String, ServerRegistration>,
    pending: HashMap<String, PendingSession>,
    sessions: HashMap<String, ClientSession>,
    identities: HashMap<ConnId, ConnectionIdentity>,
    /// Source address per connection, used only for rate limiting
    addresses: HashMap<ConnId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh a server registration for an already-normalized
    /// remote id
    pub fn register_server(
        &mut self,
        conn: ConnId,
        remote_id: &str,
        ice_servers: Option<Vec<IceServer>>,
    ) -> RegisterOutcome {
        if let Some(existing) = self.servers.get_mut(remote_id) {
            if existing.conn == conn {
                if let Some(ice) = ice_servers {
                    existing.ice_servers = Some(ice);
                }
                return RegisterOutcome::Refreshed;
            }
        }

        // A connection moving to a new remote id releases its old
        // registration; nothing else would ever clean it up
        let released = match self.identities.get(&conn) {
            Some(ConnectionIdentity::Server(old_id)) if old_id != remote_id => {
                let old_id = old_id.clone();
                self.servers.remove(&old_id);
                Some(old_id)
            }
            _ => None,
        };

        let evicted = self.servers.remove(remote_id).map(|old| {
            self.identities.remove(&old.conn);
            old.conn
        });

        self.servers.insert(
            remote_id.to_string(),
            ServerRegistration {
                remote_id: remote_id.to_string(),
                conn,
                ice_servers,
            },
        );
        self.identities
            .insert(conn, ConnectionIdentity::Server(remote_id.to_string()));

        RegisterOutcome::Installed { evicted, released }
    }

    pub fn lookup_server(&self, remote_id: &str) -> Option<&ServerRegistration> {
        self.servers.get(remote_id)
    }

    /// Existence check, case-insensitive
    pub fn is_online(&self, remote_id: &str) -> bool {
        self.servers.contains_key(&normalize_remote_id(remote_id))
    }

    /// Remove a registration only if the given connection still owns it,
    /// so a stale disconnect cannot clobber a newer registration
    pub fn remove_server_if_owner(&mut self, conn: ConnId, remote_id: &str) -> bool {
        match self.servers.get(remote_id) {
            Some(reg) if reg.conn == conn => {
                self.servers.remove(remote_id);
                true
            }
            _ => false,
        }
    }

    pub fn insert_pending(&mut self, pending: PendingSession) {
        self.pending.insert(pending.session_id.clone(), pending);
    }

    /// Remove and return a pending session. This is the sole guard of the
    /// promotion race: whichever of fresh-ICE and fallback gets the record
    /// wins, the other sees None and becomes a no-op.
    pub fn take_pending(&mut self, session_id: &str) -> Option<PendingSession> {
        self.pending.remove(session_id)
    }

    pub fn insert_session(&mut self, session: ClientSession) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn session(&self, session_id: &str) -> Option<&ClientSession> {
        self.sessions.get(session_id)
    }

    pub fn remove_session(&mut self, session_id: &str) -> Option<ClientSession> {
        self.sessions.remove(session_id)
    }

    pub fn identity(&self, conn: ConnId) -> Option<&ConnectionIdentity> {
        self.identities.get(&conn)
    }

    pub fn set_identity(&mut self, conn: ConnId, identity: ConnectionIdentity) {
        self.identities.insert(conn, identity);
    }

    pub fn remove_identity(&mut self, conn: ConnId) -> Option<ConnectionIdentity> {
        self.identities.remove(&conn)
    }

    pub fn set_address(&mut self, conn: ConnId, addr: String) {
        self.addresses.insert(conn, addr);
    }

    pub fn address(&self, conn: ConnId) -> Option<&String> {
        self.addresses.get(&conn)
    }

    pub fn remove_address(&mut self, conn: ConnId) {
        self.addresses.remove(&conn);
    }

    /// Active session ids bound to a remote id
    pub fn session_ids_for(&self, remote_id: &str) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.remote_id == remote_id)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Pending session ids bound to a remote id
    pub fn pending_ids_for(&self, remote_id: &str) -> Vec<String> {
        self.pending
            .values()
            .filter(|p| p.remote_id == remote_id)
            .map(|p| p.session_id.clone())
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_remote_id() {
        assert_eq!(normalize_remote_id("abc123"), "ABC123");
        assert_eq!(normalize_remote_id("  MiXeD42 "), "MIXED42");
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ConnectionRegistry::new();

        let outcome = reg.register_server(1, "ABC123", None);
        assert_eq!(
            outcome,
            RegisterOutcome::Installed {
                evicted: None,
                released: None
            }
        );

        assert!(reg.lookup_server("ABC123").is_some());
        assert!(reg.is_online("abc123"));
        assert!(!reg.is_online("XYZ789"));
        assert_eq!(
            reg.identity(1),
            Some(&ConnectionIdentity::Server("ABC123".into()))
        );
    }

    #[test]
    fn test_same_connection_refreshes_ice() {
        let mut reg = ConnectionRegistry::new();
        reg.register_server(1, "ABC123", None);

        let ice = vec![crate::messages::IceServer {
            urls: serde_json::json!("stun:stun.example.com"),
            username: None,
            credential: None,
        }];
        let outcome = reg.register_server(1, "ABC123", Some(ice.clone()));
        assert_eq!(outcome, RegisterOutcome::Refreshed);
        assert_eq!(
            reg.lookup_server("ABC123").unwrap().ice_servers,
            Some(ice.clone())
        );

        // Refresh without ICE servers keeps the previous ones
        let outcome = reg.register_server(1, "ABC123", None);
        assert_eq!(outcome, RegisterOutcome::Refreshed);
        assert_eq!(reg.lookup_server("ABC123").unwrap().ice_servers, Some(ice));
    }

    #[test]
    fn test_different_connection_evicts_previous() {
        let mut reg = ConnectionRegistry::new();
        reg.register_server(1, "ABC123", None);

        let outcome = reg.register_server(2, "ABC123", None);
        assert_eq!(
            outcome,
            RegisterOutcome::Installed {
                evicted: Some(1),
                released: None
            }
        );

        assert_eq!(reg.lookup_server("ABC123").unwrap().conn, 2);
        assert!(reg.identity(1).is_none());
        assert_eq!(
            reg.identity(2),
            Some(&ConnectionIdentity::Server("ABC123".into()))
        );
    }

    #[test]
    fn test_new_remote_id_releases_previous_registration() {
        let mut reg = ConnectionRegistry::new();
        reg.register_server(1, "AAA111", None);

        let outcome = reg.register_server(1, "BBB222", None);
        assert_eq!(
            outcome,
            RegisterOutcome::Installed {
                evicted: None,
                released: Some("AAA111".into())
            }
        );

        assert!(!reg.is_online("AAA111"));
        assert!(reg.is_online("BBB222"));
        assert_eq!(
            reg.identity(1),
            Some(&ConnectionIdentity::Server("BBB222".into()))
        );

        // Disconnect now covers the only registration left
        assert!(reg.remove_server_if_owner(1, "BBB222"));
        assert_eq!(reg.server_count(), 0);
    }

    #[test]
    fn test_remove_server_if_owner() {
        let mut reg = ConnectionRegistry::new();
        reg.register_server(1, "ABC123", None);
        reg.register_server(2, "ABC123", None);

        // Stale disconnect from the evicted connection must not remove
        // the newer registration
        assert!(!reg.remove_server_if_owner(1, "ABC123"));
        assert!(reg.is_online("ABC123"));

        assert!(reg.remove_server_if_owner(2, "ABC123"));
        assert!(!reg.is_online("ABC123"));
    }

    #[test]
    fn test_session_lookups_by_remote_id() {
        let mut reg = ConnectionRegistry::new();
        reg.insert_session(ClientSession {
            session_id: "s1".into(),
            remote_id: "ABC123".into(),
            conn: 10,
        });
        reg.insert_session(ClientSession {
            session_id: "s2".into(),
            remote_id: "OTHER".into(),
            conn: 11,
        });

        assert_eq!(reg.session_ids_for("ABC123"), vec!["s1".to_string()]);
        assert_eq!(reg.session_count(), 2);

        assert!(reg.remove_session("s1").is_some());
        assert!(reg.remove_session("s1").is_none());
    }
}
