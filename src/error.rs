//! Error types for the engine

use thiserror::Error;

/// Errors reported by the board codec, the tree and the scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A piece was dropped into a column that already holds `HEIGHT` pieces
    #[error("Invalid move, column {column} full")]
    ColumnFull { column: usize },

    /// The column is out of range, has no legal child, or the game is over
    #[error("Invalid move, column {column} cannot be played")]
    InvalidColumn { column: usize },

    /// The tree reached a state it should never be in; continuing would corrupt it
    #[error("Tree invariant violated: {0}")]
    TreeInvariantViolation(String),
}

impl EngineError {
    /// Whether the error should stop all further computation
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::TreeInvariantViolation(_))
    }

    pub(crate) fn invariant<S: Into<String>>(message: S) -> Self {
        EngineError::TreeInvariantViolation(message.into())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
