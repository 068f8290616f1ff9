//! Beacon Signal Server
//!
//! Signaling broker for WebRTC connection setup. Long-lived "server"
//! endpoints register under a shareable remote id; short-lived "client"
//! endpoints connect to one by id. The broker exchanges session
//! descriptions and ICE candidates between the two and never touches
//! media.
//!
//! # Protocol
//!
//! 1. Server registers a remote id, optionally with ICE servers
//! 2. Client sends a connect request for that id
//! 3. Broker notifies the server and waits up to 10 s for fresh ICE
//!    servers, falling back to the ones cached at registration
//! 4. Offer/answer/ICE candidates are forwarded across the session
//! 5. Peers establish a direct connection; the session outlives only
//!    the signaling handshake

pub mod error;
pub mod messages;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use error::SignalError;
pub use messages::{IceServer, SignalMessage};
pub use rate_limit::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use registry::ConnectionRegistry;
pub use router::{MessageRouter, Stats};
pub use server::{ServerConfig, SignalServer};
pub use session::SessionBroker;
pub use transport::{ConnId, Transport};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;

/// Seconds a pending session waits for fresh ICE servers before falling
/// back to the cached ones
pub const FALLBACK_TIMEOUT_SECS: u64 = 10;
