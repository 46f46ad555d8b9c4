//! # Noughts Game Server
//!
//! Authoritative session server for two-player noughts and crosses, against
//! another player or the computer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      NOUGHTS SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/            - Session rules (transport-free)           │
//! │  ├── board.rs     - Positions, win lines, outcome            │
//! │  ├── state.rs     - Session, player and move types           │
//! │  ├── events.rs    - Session events for channel fan-out       │
//! │  ├── arbiter.rs   - Move validation and turn order           │
//! │  └── agent.rs     - Computer move generation                 │
//! │                                                              │
//! │  network/         - Service plumbing                         │
//! │  ├── auth.rs      - Session tokens (JWT)                     │
//! │  ├── session.rs   - Session registry and eviction            │
//! │  ├── matchmaker.rs- Player pairing                           │
//! │  ├── publisher.rs - Channels and subscription signing        │
//! │  ├── service.rs   - join / make_move / subscribe             │
//! │  ├── protocol.rs  - Message types                            │
//! │  └── server.rs    - WebSocket server                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Each session is guarded by its own lock. A move, the computer's reply
//! and the events they publish happen as one unit under that lock, and
//! PLAYER_VS_PLAYER seat assignment is serialized through the waiting list.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::board::{evaluate, Outcome, Position};
pub use game::state::{GameMode, GameSession, GameStatus, InputType, PlayerId, SessionId};
pub use network::service::{GameService, ServiceConfig, ServiceError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
