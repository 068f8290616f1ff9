//! Transport seam between the signaling core and the network adapter
//!
//! The core never touches sockets. It addresses peers by an opaque
//! connection id and calls back into the adapter to deliver or drop them.

use crate::messages::SignalMessage;

/// Opaque per-connection handle, assigned by the adapter
pub type ConnId = u64;

/// Close code sent when a newer registration takes over a remote id
pub const CLOSE_REPLACED: u16 = 4000;

/// Close code sent when an address is blocked for abuse mid-connection
pub const CLOSE_BLOCKED: u16 = 4008;

/// Close code sent when a connection is refused at accept time
pub const CLOSE_RATE_LIMITED: u16 = 4029;

/// Adapter-supplied delivery primitives
///
/// Both calls are fire-and-forget from the core's perspective: a failed
/// send or close is the adapter's problem to log, never a state change.
pub trait Transport: Send + Sync {
    /// Deliver a message to a connection, if it is still around
    fn send(&self, conn: ConnId, msg: &SignalMessage);

    /// Close a connection with a code and human-readable reason
    fn close(&self, conn: ConnId, code: u16, reason: &str);
}
