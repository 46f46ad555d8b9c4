//! Game Events
//!
//! State transitions produced by the matchmaker and the arbiter, in the
//! order they happened. Each carries the full session snapshot taken at
//! that point.

use serde::{Deserialize, Serialize};

use crate::game::state::GameSession;

/// Realtime event kinds pushed to session channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEventKind {
    /// A second player (or the computer) took a seat.
    Joined,
    /// A non-terminal move was played.
    TurnPlayed,
    /// The session moved to IN_PROGRESS.
    Started,
    /// The session reached a win or a draw.
    Finished,
}

impl GameEventKind {
    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            GameEventKind::Joined => "JOINED",
            GameEventKind::TurnPlayed => "TURN_PLAYED",
            GameEventKind::Started => "STARTED",
            GameEventKind::Finished => "FINISHED",
        }
    }
}

/// An event plus the snapshot it describes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Event kind.
    pub kind: GameEventKind,
    /// Session state right after the transition.
    pub session: GameSession,
}

impl GameEvent {
    /// Snapshot the session under the given kind.
    pub fn snapshot(kind: GameEventKind, session: &GameSession) -> Self {
        Self {
            kind,
            session: session.clone(),
        }
    }

    /// Create joined event.
    pub fn joined(session: &GameSession) -> Self {
        Self::snapshot(GameEventKind::Joined, session)
    }

    /// Create started event.
    pub fn started(session: &GameSession) -> Self {
        Self::snapshot(GameEventKind::Started, session)
    }

    /// Create turn played event.
    pub fn turn_played(session: &GameSession) -> Self {
        Self::snapshot(GameEventKind::TurnPlayed, session)
    }

    /// Create finished event.
    pub fn finished(session: &GameSession) -> Self {
        Self::snapshot(GameEventKind::Finished, session)
    }
}
