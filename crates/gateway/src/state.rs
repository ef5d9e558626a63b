//! Per-connection state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_core::Identity;
use uuid::Uuid;

/// Identifies one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a connection is in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProtocolState {
    Unauthenticated,
    Authenticated,
    Joined { session_id: String },
    Streaming { session_id: String },
    Closed,
}

impl ProtocolState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::Joined { .. } => "joined",
            Self::Streaming { .. } => "streaming",
            Self::Closed => "closed",
        }
    }

    /// The bound session, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Joined { session_id } | Self::Streaming { session_id } => Some(session_id),
            _ => None,
        }
    }
}

/// Transient state of one connection. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub identity: Option<Identity>,
    pub protocol: ProtocolState,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            identity: None,
            protocol: ProtocolState::Unauthenticated,
            opened_at: Utc::now(),
        }
    }
}
