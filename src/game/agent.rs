//! Computer Agent
//!
//! Produces moves for AUTOMATIC players. Agents only read the session;
//! the arbiter applies whatever they return.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::game::board::{Board, Outcome, Position};
use crate::game::state::{GameSession, PlayerId};

/// Move generator for automatic-input players.
pub trait ComputerAgent: Send + Sync + fmt::Debug {
    /// Pick a free position for the player whose turn it is.
    ///
    /// Returns `None` only when the board is full or the session has no
    /// current turn holder.
    fn choose_move(&self, session: &GameSession) -> Option<Position>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Takes the lowest-numbered free position.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl ComputerAgent for FirstAvailable {
    fn choose_move(&self, session: &GameSession) -> Option<Position> {
        session.current_turn_player_id?;
        let board = session.board().ok()?;
        let first = board.available().next();
        first
    }

    fn name(&self) -> &'static str {
        "first_available"
    }
}

/// Full-depth minimax with alpha-beta pruning.
///
/// Prefers quicker wins and slower losses; ties go to the lowest position.
#[derive(Debug, Default, Clone, Copy)]
pub struct Minimax;

const WIN_SCORE: i32 = 10;

impl Minimax {
    #[allow(clippy::too_many_arguments)]
    fn score(
        board: &mut Board,
        me: PlayerId,
        them: PlayerId,
        my_turn: bool,
        depth: i32,
        mut alpha: i32,
        mut beta: i32,
    ) -> i32 {
        match board.outcome() {
            Outcome::Win(p) if p == me => return WIN_SCORE - depth,
            Outcome::Win(_) => return depth - WIN_SCORE,
            Outcome::Draw => return 0,
            Outcome::Ongoing => {}
        }

        let moves: Vec<Position> = board.available().collect();
        let mover = if my_turn { me } else { them };
        let mut best = if my_turn { i32::MIN } else { i32::MAX };

        for position in moves {
            if board.place(mover, position).is_err() {
                continue;
            }
            let value = Self::score(board, me, them, !my_turn, depth + 1, alpha, beta);
            board.clear(position);

            if my_turn {
                best = best.max(value);
                alpha = alpha.max(best);
            } else {
                best = best.min(value);
                beta = beta.min(best);
            }
            if beta <= alpha {
                break;
            }
        }

        best
    }
}

impl ComputerAgent for Minimax {
    fn choose_move(&self, session: &GameSession) -> Option<Position> {
        let me = session.current_turn_player_id?;
        let them = session.opponent_of(&me)?.id;
        let mut board = session.board().ok()?;
        if board.outcome().is_terminal() {
            return None;
        }

        let moves: Vec<Position> = board.available().collect();
        let mut best: Option<(Position, i32)> = None;

        for position in moves {
            if board.place(me, position).is_err() {
                continue;
            }
            let value = Self::score(&mut board, me, them, false, 1, i32::MIN, i32::MAX);
            board.clear(position);

            if best.map_or(true, |(_, score)| value > score) {
                best = Some((position, value));
            }
        }

        best.map(|(position, _)| position)
    }

    fn name(&self) -> &'static str {
        "minimax"
    }
}

/// Configured agent strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStrategy {
    /// [`Minimax`].
    #[default]
    Minimax,
    /// [`FirstAvailable`].
    FirstAvailable,
}

impl AgentStrategy {
    /// Read `COMPUTER_STRATEGY`, defaulting to minimax.
    pub fn from_env() -> Self {
        match std::env::var("COMPUTER_STRATEGY").as_deref() {
            Ok("first_available") | Ok("first") => AgentStrategy::FirstAvailable,
            _ => AgentStrategy::Minimax,
        }
    }

    /// Instantiate the agent.
    pub fn build(self) -> Arc<dyn ComputerAgent> {
        match self {
            AgentStrategy::Minimax => Arc::new(Minimax),
            AgentStrategy::FirstAvailable => Arc::new(FirstAvailable),
        }
    }
}
