/// Error type shared by the evasion subsystem
///
/// Malformed input never surfaces here on the send path: the fragmentation
/// engine falls back to an unsplit plan instead. What the caller sees is either
/// an I/O failure on the real connection, a cancellation/timeout, or the
/// distinguished `Blocked` outcome when the censor resets the connection.
use std::io;

pub type Result<T> = std::result::Result<T, EvasionError>;

#[derive(Debug, thiserror::Error)]
pub enum EvasionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection was reset while the ClientHello was in flight, or while
    /// relaying right after it. The caller may react (bypass policy, etc).
    #[error("Connection blocked by middlebox: {0}")]
    Blocked(io::Error),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("No SNI found in ClientHello")]
    NoSni,
}

impl EvasionError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Map an I/O error from the real connection to an evasion outcome
///
/// A reset (or abort) right after the handshake is the signature of an inline
/// censor injecting RST, so it becomes `Blocked` rather than a plain `Io`.
pub fn classify_relay_error(err: io::Error) -> EvasionError {
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => EvasionError::Blocked(err),
        _ => EvasionError::Io(err),
    }
}
