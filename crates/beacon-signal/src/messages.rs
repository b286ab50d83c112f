//! Presence channel messages

use beacon_core::IceServer;
use serde::{Deserialize, Serialize};

/// Messages exchanged over the presence WebSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceMessage {
    /// Client announces itself and the room it is in
    Hello { room: Option<String> },

    /// Server accepted the client
    Welcome {
        client_id: String,
        ice_servers: Vec<IceServer>,
    },

    /// Client liveness signal
    Heartbeat,

    /// Server liveness probe
    Ping { timestamp: u64 },

    /// Answer to a probe
    Pong { timestamp: u64 },

    /// Client asks for a fresh ICE server list
    IceServersRequest,

    /// ICE server list
    IceServers { servers: Vec<IceServer> },

    /// Client is leaving
    Leave,

    /// Server evicted the client
    Bye,

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed
    InvalidMessage,

    /// Client sent something before `hello`
    NotRegistered,

    /// Client sent a second `hello`
    AlreadyRegistered,

    /// Internal server error
    InternalError,
}

impl PresenceMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
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
}
