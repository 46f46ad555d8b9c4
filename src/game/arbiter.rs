//! Turn Arbiter
//!
//! Authoritative move application for one session. Validates the move,
//! appends it, evaluates the board and advances the turn. Automatic
//! players are played out by the computer agent before returning, so the
//! caller always sees a state where either a MANUAL player is to move or
//! the game is over.
//!
//! Callers must hold the session's exclusive lock for the whole call.

use tracing::{debug, error};

use crate::game::agent::ComputerAgent;
use crate::game::board::{evaluate, Outcome, Position};
use crate::game::events::GameEvent;
use crate::game::state::{GameSession, GameStatus, Move, PlayerId};

/// Move rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    /// Caller is not the current turn holder.
    #[error("not your turn")]
    NotYourTurn,
    /// Session already finished.
    #[error("game already finished")]
    GameFinished,
    /// Choice missing, off the board or occupied.
    #[error("invalid choice: {0}")]
    InvalidChoice(String),
    /// The stored board is inconsistent or the agent produced no legal move.
    #[error("corrupted board: {0}")]
    CorruptBoard(String),
}

/// Play a client-submitted move, then any automatic continuation.
///
/// On error the session is left untouched.
pub fn play_turn(
    session: &mut GameSession,
    player: PlayerId,
    choice: Option<i64>,
    agent: &dyn ComputerAgent,
) -> Result<Vec<GameEvent>, MoveError> {
    let position = check_turn(session, player, choice)?;
    let snapshot = session.clone();

    let mut events = vec![apply(session, player, position)?];
    match play_automatic_turns(session, agent) {
        Ok(more) => events.extend(more),
        Err(e) => {
            *session = snapshot;
            return Err(e);
        }
    }
    Ok(events)
}

/// Let the agent move for every consecutive AUTOMATIC turn holder.
pub fn play_automatic_turns(
    session: &mut GameSession,
    agent: &dyn ComputerAgent,
) -> Result<Vec<GameEvent>, MoveError> {
    let mut events = Vec::new();

    while session.status == GameStatus::InProgress {
        let Some(current) = session.current_player() else {
            return Err(MoveError::CorruptBoard("no turn holder".into()));
        };
        if !current.is_automatic() {
            break;
        }
        let player = current.id;

        let Some(position) = agent.choose_move(session) else {
            error!(session_id = %session.id, agent = agent.name(), "agent produced no move");
            return Err(MoveError::CorruptBoard("agent produced no move".into()));
        };

        let event = match check_turn(session, player, Some(u8::from(position) as i64)) {
            Ok(position) => apply(session, player, position)?,
            Err(e) => {
                error!(
                    session_id = %session.id,
                    agent = agent.name(),
                    error = %e,
                    "agent produced an illegal move"
                );
                return Err(MoveError::CorruptBoard(e.to_string()));
            }
        };
        debug!(
            session_id = %session.id,
            player = %player.short(),
            choice = position.index(),
            "automatic move"
        );
        events.push(event);
    }

    Ok(events)
}

/// Validate a prospective move without mutating.
fn check_turn(
    session: &GameSession,
    player: PlayerId,
    choice: Option<i64>,
) -> Result<Position, MoveError> {
    match session.status {
        GameStatus::Finished => return Err(MoveError::GameFinished),
        GameStatus::WaitingForPlayer => return Err(MoveError::NotYourTurn),
        GameStatus::InProgress => {}
    }

    if session.current_turn_player_id != Some(player) {
        return Err(MoveError::NotYourTurn);
    }

    let raw = choice.ok_or_else(|| MoveError::InvalidChoice("choice is required".into()))?;
    let position = Position::from_choice(raw)
        .ok_or_else(|| MoveError::InvalidChoice(format!("position {} is off the board", raw)))?;

    let board = session
        .board()
        .map_err(|e| MoveError::CorruptBoard(e.to_string()))?;
    if !board.is_empty(position) {
        return Err(MoveError::InvalidChoice(format!("position {} is already occupied", raw)));
    }

    Ok(position)
}

/// Append a validated move and advance the session.
fn apply(
    session: &mut GameSession,
    player: PlayerId,
    position: Position,
) -> Result<GameEvent, MoveError> {
    let next = session
        .opponent_of(&player)
        .map(|p| p.id)
        .ok_or_else(|| MoveError::CorruptBoard("missing opponent".into()))?;

    session.moves.push(Move { player_id: player, choice: position });
    let outcome = match evaluate(&session.moves) {
        Ok(outcome) => outcome,
        Err(e) => {
            session.moves.pop();
            return Err(MoveError::CorruptBoard(e.to_string()));
        }
    };
    session.touch();

    let event = match outcome {
        Outcome::Win(winner) => {
            session.status = GameStatus::Finished;
            session.winner_id = Some(winner);
            session.current_turn_player_id = None;
            debug!(session_id = %session.id, winner = %winner.short(), "session won");
            GameEvent::finished(session)
        }
        Outcome::Draw => {
            session.status = GameStatus::Finished;
            session.winner_id = None;
            session.current_turn_player_id = None;
            debug!(session_id = %session.id, "session drawn");
            GameEvent::finished(session)
        }
        Outcome::Ongoing => {
            session.current_turn_player_id = Some(next);
            GameEvent::turn_played(session)
        }
    };

    Ok(event)
}
