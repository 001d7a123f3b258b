//! Error types for the bulletin board core.
//!
//! Every failure the core can produce maps to one of the [`BoardError`]
//! kinds.  Protocol and not-found errors are answered inline on the
//! session and never terminate it; transport errors end exactly one
//! session; nothing here is process-fatal.

use thiserror::Error;

/// Failure kinds produced by the bulletin board core.
#[derive(Debug, Error)]
pub enum BoardError {
    /// Malformed command or arguments.  Answered inline, the session
    /// continues reading lines.
    #[error("invalid command arguments")]
    Protocol,

    /// Unknown record id.  A normal, non-fatal outcome reported to the
    /// caller.
    #[error("unknown record id {0}")]
    NotFound(u32),

    /// Store I/O failure (create, size, map or flush of the backing file).
    #[error("store failure: {0}")]
    System(#[from] std::io::Error),

    /// Peer unreachable, peer timeout, or peer refused the transaction.
    /// Surfaces to the client as a write system error after the abort
    /// broadcast.
    #[error("replication failed: {0}")]
    Replication(String),

    /// Read or write failure on a session socket.  Terminates that
    /// session only.
    #[error("transport failure: {0}")]
    Transport(std::io::Error),
}
