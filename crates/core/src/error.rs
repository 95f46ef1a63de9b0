use crate::clock::MatchState;

/// Result alias that carries the custom [`ArenaError`] type.
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    /// An operation was requested while the match clock was in a state that
    /// does not allow it. The clock is left untouched.
    #[error("cannot {operation} while the match is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: MatchState,
    },
    /// A remote clock datagram carried a command code outside the known set.
    #[error("unknown remote clock command code {0}")]
    UnknownCommandCode(u16),
    /// A remote clock datagram did not have the fixed record length.
    #[error("remote clock packet must be 4 bytes, got {len}")]
    MalformedPacket { len: usize },
    /// More time than the clock and the display can hold.
    #[error("{requested_ms} ms is more than the clock can show ({max_ms} ms)")]
    TimeOutOfRange { requested_ms: u64, max_ms: u64 },
    /// The controller was shut down and no longer accepts match operations.
    #[error("match controller has been stopped")]
    Stopped,
    #[error("unknown team colour `{0}`")]
    UnknownTeam(String),
    /// Configuration could not be parsed.
    #[error("{0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form failure, mostly poisoned locks.
    #[error("{0}")]
    Message(String),
}

impl ArenaError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns `true` when the error is a rejected state transition rather
    /// than an actual fault.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

impl From<&str> for ArenaError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ArenaError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
