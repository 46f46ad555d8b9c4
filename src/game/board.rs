//! Board and Outcome Evaluation
//!
//! Pure functions over a move history. A 3x3 grid, positions numbered
//! 0..=8 in row-major order:
//!
//! ```text
//!  0 | 1 | 2
//! ---+---+---
//!  3 | 4 | 5
//! ---+---+---
//!  6 | 7 | 8
//! ```

use serde::{Deserialize, Serialize};

use crate::game::state::{Move, PlayerId};

/// Number of playable positions.
pub const BOARD_CELLS: usize = 9;

/// Every three-in-a-row line.
pub const WIN_LINES: [[u8; 3]; 8] = [
    // Rows
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    // Columns
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    // Diagonals
    [0, 4, 8],
    [2, 4, 6],
];

/// A validated board position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Position(u8);

impl Position {
    /// All positions in ascending order.
    pub const ALL: [Position; BOARD_CELLS] = [
        Position(0),
        Position(1),
        Position(2),
        Position(3),
        Position(4),
        Position(5),
        Position(6),
        Position(7),
        Position(8),
    ];

    /// Create from an index, if on the board.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < BOARD_CELLS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Create from an untrusted client integer.
    pub fn from_choice(choice: i64) -> Option<Self> {
        u8::try_from(choice).ok().and_then(Self::new)
    }

    /// Index into the cell array.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for Position {
    type Error = BoardError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Position::new(value).ok_or(BoardError::OutOfRange(value as i64))
    }
}

impl From<Position> for u8 {
    fn from(position: Position) -> Self {
        position.0
    }
}

/// Result of evaluating a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Moves remain and nobody has won.
    Ongoing,
    /// A player completed a line.
    Win(PlayerId),
    /// Board full, no line completed.
    Draw,
}

impl Outcome {
    /// Whether the game is over.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Ongoing)
    }
}

/// Illegal histories or moves.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    /// Position outside 0..=8.
    #[error("position {0} is off the board")]
    OutOfRange(i64),
    /// Position already taken.
    #[error("position {0} is already occupied")]
    Occupied(u8),
    /// A move was recorded after the game ended.
    #[error("move recorded after the game ended")]
    AfterGameOver,
}

/// Cell contents derived from a history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Board {
    cells: [Option<PlayerId>; BOARD_CELLS],
}

impl Board {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a board from a move history, rejecting illegal sequences.
    pub fn replay(history: &[Move]) -> Result<Self, BoardError> {
        let mut board = Self::new();
        for mv in history {
            if board.outcome().is_terminal() {
                return Err(BoardError::AfterGameOver);
            }
            board.place(mv.player_id, mv.choice)?;
        }
        Ok(board)
    }

    /// Occupant of a position.
    #[inline]
    pub fn get(&self, position: Position) -> Option<PlayerId> {
        self.cells[position.index()]
    }

    /// Whether a position is free.
    #[inline]
    pub fn is_empty(&self, position: Position) -> bool {
        self.get(position).is_none()
    }

    /// Claim a position for a player.
    pub fn place(&mut self, player: PlayerId, position: Position) -> Result<(), BoardError> {
        let cell = &mut self.cells[position.index()];
        if cell.is_some() {
            return Err(BoardError::Occupied(position.into()));
        }
        *cell = Some(player);
        Ok(())
    }

    /// Release a position (used by search).
    pub(crate) fn clear(&mut self, position: Position) {
        self.cells[position.index()] = None;
    }

    /// Free positions in ascending order.
    pub fn available(&self) -> impl Iterator<Item = Position> + '_ {
        Position::ALL.into_iter().filter(|&p| self.is_empty(p))
    }

    /// Whether every position is taken.
    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// Player owning a completed line, if any.
    pub fn winner(&self) -> Option<PlayerId> {
        WIN_LINES.iter().find_map(|&[a, b, c]| {
            let first = self.cells[a as usize]?;
            let complete = self.cells[b as usize] == Some(first)
                && self.cells[c as usize] == Some(first);
            complete.then_some(first)
        })
    }

    /// Terminal status of this board.
    pub fn outcome(&self) -> Outcome {
        match self.winner() {
            Some(player) => Outcome::Win(player),
            None if self.is_full() => Outcome::Draw,
            None => Outcome::Ongoing,
        }
    }
}

/// Decide legality and terminal status of a move history.
///
/// Total and side-effect free: identical histories always evaluate
/// identically.
pub fn evaluate(history: &[Move]) -> Result<Outcome, BoardError> {
    Board::replay(history).map(|board| board.outcome())
}
