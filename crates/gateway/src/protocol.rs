//! Wire protocol: JSON text frames tagged by `type`.
//!
//! Client → server: `join`, `message`, `leave`.
//! Server → client: `authenticated`, `join`, `stream_start`, `stream_chunk`,
//! `stream_end`, `leave`, `error`.

use serde::{Deserialize, Serialize};
use tandem_core::{Identity, ValidationError};

/// Close code for a missing or rejected access token.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Message {
        content: String,
    },
    Leave,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        user: Identity,
    },
    #[serde(rename = "join")]
    Joined {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    StreamStart,
    StreamChunk {
        content: String,
    },
    StreamEnd {
        content: String,
    },
    #[serde(rename = "leave")]
    Left {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","error":"Internal error"}"#.to_string())
    }
}

/// What the handler hands to the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

/// Everything a client can be told went wrong. The `Display` text is the
/// `error` field of the frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing_token")]
    MissingToken,

    #[error("invalid_token")]
    InvalidToken,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session is not active")]
    SessionNotActive,

    #[error("Not joined to a session")]
    NotJoined,

    #[error("A response is already being generated")]
    Busy,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Generation failed: could not build context")]
    ContextUnavailable,

    #[error("Storage unavailable")]
    Storage,
}

impl From<ValidationError> for ProtocolError {
    fn from(e: ValidationError) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}
