//! Network Layer
//!
//! Service plumbing around the game rules: tokens, the session registry,
//! matchmaking, channel fan-out and the WebSocket server.
//! This layer is **non-deterministic** - all game rules run through `game/`.

pub mod auth;
pub mod matchmaker;
pub mod protocol;
pub mod publisher;
pub mod server;
pub mod service;
pub mod session;

pub use auth::{AuthConfig, AuthError, TokenBinding, TokenClaims, TokenIssuer};
pub use matchmaker::{normalize_email, JoinError, JoinOutcome, Matchmaker};
pub use protocol::{ClientMessage, ErrorCode, GameResponse, ServerMessage, SubscriptionResponse};
pub use publisher::{ChannelConfig, ChannelKind, ChannelMessage, EventPublisher, SubscriptionGrant};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use service::{ErrorCategory, GameService, ServiceConfig, ServiceError};
pub use session::{RegistryConfig, SessionRegistry};
