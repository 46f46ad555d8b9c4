//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON, tagged by `type`. Payload field names are
//! camelCase to match the session wire format.

use serde::{Deserialize, Serialize};

use crate::game::state::{GameMode, GameSession, InputType, SessionId};
use crate::network::publisher::{ChannelMessage, SubscriptionGrant};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join matchmaking.
    Join(JoinRequest),

    /// Play a move in a session.
    MakeMove(MoveRequest),

    /// Subscribe this socket to a session channel.
    Subscribe(SubscribeRequest),

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed in the pong.
        timestamp: u64,
    },
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Player email.
    pub email: String,
    /// Pairing mode.
    pub mode: GameMode,
    /// How the player's moves are produced.
    pub input_type: InputType,
}

/// Move request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    /// Board position; `null` only makes sense for automatic players.
    #[serde(default)]
    pub choice: Option<i64>,
    /// Target session.
    pub game_id: SessionId,
    /// Bearer token from the join response.
    pub token: String,
}

/// Channel subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Bearer token from the join response.
    pub token: String,
    /// Target session, defaults to the token's session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<SessionId>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted; carries the socket id used for channel auth.
    Connected {
        /// Id to present when signing channel subscriptions.
        #[serde(rename = "socketId")]
        socket_id: String,
    },

    /// Join result.
    Joined(GameResponse),

    /// Session snapshot after a move.
    Game(GameSession),

    /// Channel subscription granted.
    Subscribed(SubscriptionResponse),

    /// Event pushed on a subscribed channel.
    Event(ChannelMessage),

    /// Error notification.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Client timestamp echoed back.
        timestamp: u64,
        /// Server wall clock in Unix milliseconds.
        #[serde(rename = "serverTime")]
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Why the server is going away.
        reason: String,
    },
}

/// Join response: the session plus the caller's token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameResponse {
    /// Session snapshot.
    pub game: GameSession,
    /// Bearer token scoped to this player and session.
    pub token: String,
}

/// Subscription response.
pub type SubscriptionResponse = SubscriptionGrant;

/// Error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Email failed validation.
    InvalidEmail,
    /// Move choice missing, off the board or occupied.
    InvalidChoice,
    /// Caller is not the turn holder.
    NotYourTurn,
    /// Session already finished.
    GameFinished,
    /// Session is full.
    SessionCapacityExceeded,
    /// Session does not exist or was evicted.
    SessionNotFound,
    /// Missing or mismatched credentials.
    Unauthorized,
    /// Message could not be parsed.
    InvalidMessage,
    /// Server at capacity.
    ServerFull,
    /// Internal server error.
    InternalError,
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
