//! Game Logic Module
//!
//! Transport-free session rules. Everything here is deterministic except
//! id generation and timestamps.
//!
//! ## Module Structure
//!
//! - `board`: Positions, win lines, outcome evaluation
//! - `state`: Session, player and move types
//! - `events`: Session state transitions for channel fan-out
//! - `arbiter`: Move validation, turn order, automatic continuation
//! - `agent`: Computer move generation

pub mod board;
pub mod state;
pub mod events;
pub mod arbiter;
pub mod agent;

// Re-export key types
pub use board::{evaluate, Board, BoardError, Outcome, Position, WIN_LINES};
pub use state::{GameMode, GameSession, GameStatus, InputType, Move, Player, PlayerId, SessionId};
pub use events::{GameEvent, GameEventKind};
pub use arbiter::{play_automatic_turns, play_turn, MoveError};
pub use agent::{AgentStrategy, ComputerAgent, FirstAvailable, Minimax};
