//! Error types for pqlink.

use thiserror::Error;

/// Result type for pqlink operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Identity of a transaction scope, used to target a [`Error::Rollback`]
/// signal at a specific enclosing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u64);

/// Error type for pqlink.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure originating in the protocol handle: bad connection, dropped
    /// socket, server error on a driver-issued command, use after close.
    #[error("operational error: {0}")]
    Operational(String),

    /// Caller misuse: changing autocommit or calling commit/rollback inside
    /// a transaction scope, invalid arguments to connect.
    #[error("programming error: {0}")]
    Programming(String),

    /// Server-reported error on an arbitrary user command.
    #[error("database error: {0}")]
    Database(String),

    /// The session encoding has no local codec, or data cannot be
    /// represented in it.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Unexpected protocol handle state.
    #[error("internal error: {0}")]
    Internal(String),

    /// Control-flow signal requesting an early rollback of a transaction
    /// scope. Not an error: the targeted scope (or the innermost one, when
    /// no target is given) swallows it on exit.
    #[error("rollback requested")]
    Rollback(Option<ScopeId>),
}

impl Error {
    /// Rollback signal for the innermost active transaction scope.
    pub fn rollback_any() -> Self {
        Error::Rollback(None)
    }

    /// Returns true if this is a rollback signal rather than an error.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Operational(format!("I/O error: {err}"))
    }
}
