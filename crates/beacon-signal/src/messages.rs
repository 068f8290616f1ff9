//! Signaling protocol messages
//!
//! One JSON object per WebSocket text frame, discriminated by a `type` tag.
//! SDP and ICE payloads are opaque to the broker and forwarded verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages exchanged over the signaling WebSocket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Application-level keepalive
    Ping,

    /// Keepalive reply
    Pong,

    /// Server endpoint registers under a shareable identifier
    RegisterServer {
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
    },

    /// Registration accepted, identifier echoed back canonicalized
    Registered { remote_id: String },

    /// Client asks to reach a registered server
    ConnectRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
    },

    /// Sent to the server: a client is waiting, prepare fresh ICE servers
    ClientConnected { session_id: String },

    /// Server delivers fresh ICE servers for a pending session
    SessionReady {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
    },

    /// Sent to the client once its session is active
    Connected {
        session_id: String,
        ice_servers: Vec<IceServer>,
    },

    /// SDP offer, forwarded without inspection
    Offer {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// SDP answer, forwarded without inspection
    Answer {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// ICE candidate, forwarded without inspection
    IceCandidate {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Sent to a client when its server goes away
    PeerDisconnected { session_id: String },

    /// Sent to a server when one of its clients goes away
    ClientDisconnected { session_id: String },

    /// Error response
    Error { error: String },
}

/// A single STUN/TURN entry, passed through untouched
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    /// One URL or a list of URLs; the broker never looks inside
    pub urls: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl SignalMessage {
    /// Create an error message
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Session id carried by a forwardable message, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Stamp a session id onto a forwardable message, replacing any
    /// client-supplied value
    pub fn with_session_id(self, id: &str) -> Self {
        match self {
            Self::Offer { data, .. } => Self::Offer {
                session_id: Some(id.to_string()),
                data,
            },
            Self::Answer { data, .. } => Self::Answer {
                session_id: Some(id.to_string()),
                data,
            },
            Self::IceCandidate { data, .. } => Self::IceCandidate {
                session_id: Some(id.to_string()),
                data,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_and_field_casing() {
        let msg = SignalMessage::RegisterServer {
            remote_id: Some("abc123".into()),
            ice_servers: None,
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("register-server"));
        assert!(json.contains("remoteId"));
        assert!(!json.contains("iceServers"));
    }

    #[test]
    fn test_missing_optional_fields_parse_as_none() {
        let msg = SignalMessage::from_json(r#"{"type":"connect-request"}"#).unwrap();
        assert_eq!(msg, SignalMessage::ConnectRequest { remote_id: None });

        let msg = SignalMessage::from_json(r#"{"type":"session-ready"}"#).unwrap();
        match msg {
            SignalMessage::SessionReady {
                session_id,
                ice_servers,
            } => {
                assert!(session_id.is_none());
                assert!(ice_servers.is_none());
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(SignalMessage::from_json(r#"{"type":"take-over"}"#).is_err());
        assert!(SignalMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_ice_server_roundtrip() {
        let ice = IceServer {
            urls: json!(["turn:turn.example.com:3478", "stun:stun.example.com"]),
            username: Some("u".into()),
            credential: Some("c".into()),
        };
        let msg = SignalMessage::Connected {
            session_id: "s".repeat(16),
            ice_servers: vec![ice.clone()],
        };

        let parsed = SignalMessage::from_json(&msg.to_json().unwrap()).unwrap();
        match parsed {
            SignalMessage::Connected { ice_servers, .. } => {
                assert_eq!(ice_servers, vec![ice]);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_session_id_stamping() {
        let msg = SignalMessage::Offer {
            session_id: Some("forged".into()),
            data: Some(json!({"sdp": "v=0"})),
        };

        let stamped = msg.with_session_id("RealSessionId123");
        assert_eq!(stamped.session_id(), Some("RealSessionId123"));
        match stamped {
            SignalMessage::Offer { data, .. } => {
                assert_eq!(data, Some(json!({"sdp": "v=0"})));
            }
            _ => panic!("wrong message type"),
        }
    }
}
