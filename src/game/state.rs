//! Session State Definitions
//!
//! The authoritative data model for a two-player session.
//! Serialized field names match the client binding (camelCase, upper-case enums).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::board::{Board, BoardError, Outcome, Position, BOARD_CELLS};

/// Number of players seated in every session.
pub const PLAYERS_PER_SESSION: usize = 2;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique player identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub uuid::Uuid);

impl PlayerId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ENUMERATIONS
// =============================================================================

/// How a player's moves are produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputType {
    /// Moves are submitted by the client.
    Manual,
    /// Moves are produced by the computer agent.
    Automatic,
}

/// Session pairing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    /// Two clients play each other.
    PlayerVsPlayer,
    /// One client plays the computer.
    PlayerVsComputer,
}

/// Session lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// One seat filled, waiting for an opponent.
    WaitingForPlayer,
    /// Both seats filled, moves being played.
    InProgress,
    /// Won or drawn.
    Finished,
}

// =============================================================================
// PLAYER / MOVE
// =============================================================================

/// A seated player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player identifier.
    pub id: PlayerId,
    /// Normalized email address.
    pub email: String,
    /// Fixed at join time.
    pub input_type: InputType,
}

impl Player {
    /// Create a player with a fresh id.
    pub fn new(email: impl Into<String>, input_type: InputType) -> Self {
        Self {
            id: PlayerId::random(),
            email: email.into(),
            input_type,
        }
    }

    /// Whether the computer agent plays for this player.
    pub fn is_automatic(&self) -> bool {
        matches!(self.input_type, InputType::Automatic)
    }
}

/// One entry of the move history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    /// Who moved.
    pub player_id: PlayerId,
    /// Where.
    pub choice: Position,
}

// =============================================================================
// SESSION
// =============================================================================

/// Invariant violations detected by [`GameSession::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Player count disagrees with status.
    #[error("status {status:?} with {players} players")]
    PlayerCount {
        /// Current status.
        status: GameStatus,
        /// Seated players.
        players: usize,
    },
    /// Turn holder is missing or not seated.
    #[error("invalid current turn holder")]
    TurnHolder,
    /// Finished without a recorded winner or a full board.
    #[error("finished without a decided outcome")]
    Undecided,
    /// Move history is not a legal game.
    #[error("illegal history: {0}")]
    History(#[from] BoardError),
}

/// One two-player game and its turn/outcome state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    /// Session identifier.
    pub id: SessionId,
    /// Sequential number assigned by the registry.
    pub number: u64,
    /// Seated players in join order.
    pub players: Vec<Player>,
    /// Whose move it is (None unless in progress).
    pub current_turn_player_id: Option<PlayerId>,
    /// Winner once finished (None on a draw).
    pub winner_id: Option<PlayerId>,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Pairing mode.
    pub mode: GameMode,
    /// Ordered move history.
    pub moves: Vec<Move>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    /// Open a session with its first player, waiting for an opponent.
    pub fn open(id: SessionId, number: u64, mode: GameMode, first: Player) -> Self {
        let now = Utc::now();
        Self {
            id,
            number,
            players: vec![first],
            current_turn_player_id: None,
            winner_id: None,
            status: GameStatus::WaitingForPlayer,
            mode,
            moves: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a seated player.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == *id)
    }

    /// Whether an email already occupies a seat.
    pub fn has_email(&self, email: &str) -> bool {
        self.players.iter().any(|p| p.email == email)
    }

    /// The player whose turn it is.
    pub fn current_player(&self) -> Option<&Player> {
        self.current_turn_player_id.and_then(|id| self.player(&id))
    }

    /// The other seated player.
    pub fn opponent_of(&self, id: &PlayerId) -> Option<&Player> {
        if self.player(id).is_none() {
            return None;
        }
        self.players.iter().find(|p| p.id != *id)
    }

    /// Board replayed from the move history.
    pub fn board(&self) -> Result<Board, BoardError> {
        Board::replay(&self.moves)
    }

    /// Whether the session has reached a terminal status.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, GameStatus::Finished)
    }

    /// Mark a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Verify the data-model invariants.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let players = self.players.len();
        let board = self.board()?;

        match self.status {
            GameStatus::WaitingForPlayer => {
                if players != 1 {
                    return Err(InvariantViolation::PlayerCount { status: self.status, players });
                }
                if self.current_turn_player_id.is_some() {
                    return Err(InvariantViolation::TurnHolder);
                }
            }
            GameStatus::InProgress => {
                if players != PLAYERS_PER_SESSION {
                    return Err(InvariantViolation::PlayerCount { status: self.status, players });
                }
                if self.current_player().is_none() {
                    return Err(InvariantViolation::TurnHolder);
                }
            }
            GameStatus::Finished => {
                if players != PLAYERS_PER_SESSION {
                    return Err(InvariantViolation::PlayerCount { status: self.status, players });
                }
                if self.current_turn_player_id.is_some() {
                    return Err(InvariantViolation::TurnHolder);
                }
                let decided = match board.outcome() {
                    Outcome::Win(winner) => self.winner_id == Some(winner),
                    Outcome::Draw => self.winner_id.is_none(),
                    Outcome::Ongoing => false,
                };
                if !decided {
                    return Err(InvariantViolation::Undecided);
                }
            }
        }

        debug_assert!(self.moves.len() <= BOARD_CELLS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting_session() -> GameSession {
        GameSession::open(
            SessionId::random(),
            1,
            GameMode::PlayerVsPlayer,
            Player::new("a@x.com", InputType::Manual),
        )
    }

    #[test]
    fn test_open_session_is_waiting() {
        let session = waiting_session();
        assert_eq!(session.status, GameStatus::WaitingForPlayer);
        assert_eq!(session.players.len(), 1);
        assert!(session.check_invariants().is_ok());
    }

    #[test]
    fn test_wire_names_match_client() {
        let session = waiting_session();
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["status"], "WAITING_FOR_PLAYER");
        assert_eq!(json["mode"], "PLAYER_VS_PLAYER");
        assert_eq!(json["players"][0]["inputType"], "MANUAL");
        assert!(json["currentTurnPlayerId"].is_null());
        assert!(json["winnerId"].is_null());
    }

    #[test]
    fn test_in_progress_requires_turn_holder() {
        let mut session = waiting_session();
        session.players.push(Player::new("b@x.com", InputType::Manual));
        session.status = GameStatus::InProgress;
        assert_eq!(session.check_invariants(), Err(InvariantViolation::TurnHolder));

        session.current_turn_player_id = Some(session.players[0].id);
        assert!(session.check_invariants().is_ok());
    }

    #[test]
    fn test_opponent_lookup() {
        let mut session = waiting_session();
        let second = Player::new("b@x.com", InputType::Automatic);
        let first_id = session.players[0].id;
        session.players.push(second.clone());

        assert_eq!(session.opponent_of(&first_id).map(|p| p.id), Some(second.id));
        assert!(session.opponent_of(&PlayerId::random()).is_none());
        assert!(session.has_email("b@x.com"));
    }
}
