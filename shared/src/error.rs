//! Error type shared by the engine, codec and controllers.

use thiserror::Error;

/// Result type alias using [`SnakeError`].
pub type Result<T> = std::result::Result<T, SnakeError>;

#[derive(Debug, Error)]
pub enum SnakeError {
    /// Datagram could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// No 5x5 area or free tail cell left on the board.
    #[error("No free 5x5 area")]
    NoSpawnSpace,

    #[error("invalid board size {0}x{1}")]
    InvalidConfig(i32, i32),

    #[error("player {0} already has a live snake")]
    SnakeExists(u32),

    #[error("no discovered game at index {0}")]
    UnknownGame(usize),

    #[error("not joined to a game")]
    NotJoined,

    /// The node's driver task has exited.
    #[error("controller stopped")]
    ControllerStopped,
}
