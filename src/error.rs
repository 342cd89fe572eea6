//! Error taxonomy for the fabric. Kinds are grouped by how a caller must
//! react to them (close the connection, surface a status code, retry, ...),
//! not by where they were raised.

use thiserror::Error;

/// The single error type threaded through codec, register-file, fabric-core
/// and connection-management code.
#[derive(Error, Debug)]
pub enum CxlError {
    /// Malformed or unsupported bytes on the wire. The connection that
    /// produced this must be closed immediately.
    #[error("decode error: {0}")]
    Decode(String),

    /// A protocol-level invariant was violated by a well-formed packet
    /// (duplicate transaction id, packet on a class-less FIFO, ...).
    /// Connection-scoped; the connection closes.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-supplied data is out of range or otherwise invalid, but the
    /// connection stays up; the caller gets a status code back.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The socket closed, cleanly or not.
    #[error("transport closed: {0}")]
    Transport(String),

    /// An invariant was violated inside the core itself. Terminates the
    /// owning component after logging; must never be silently swallowed.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CxlError>;

impl From<std::io::Error> for CxlError {
    fn from(e: std::io::Error) -> Self {
        CxlError::Transport(e.to_string())
    }
}
