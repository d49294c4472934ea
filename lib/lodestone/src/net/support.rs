use std::io;
use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Error plumbing for the networking path. `Wait` is not a failure: it marks
/// the point where a drain loop has to stop and hand control back to the
/// event demultiplexer.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The operation cannot make progress right now (`EWOULDBLOCK`).
    #[error("operation would block")]
    Wait,
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Closed,
    /// The read buffer filled up without producing a complete request.
    #[error("request exceeded the read buffer capacity")]
    Overrun,
    /// A token referencing a slot that has since been recycled.
    #[error("stale client token")]
    StaleToken,
    #[error("i/o failure: {0}")]
    Io(io::Error),
}

impl NetworkError {
    /// True for conditions that tear the connection down, false for `Wait`.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        match self {
            NetworkError::Wait => false,
            _ => true,
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> NetworkError {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            _ => NetworkError::Io(err),
        }
    }
}
