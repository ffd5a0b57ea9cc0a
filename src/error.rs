//! Error taxonomy for the connection engine
// (c) 2025 droplink contributors

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong on a [`Connection`](crate::Connection).
///
/// Send-side errors are returned to the caller of
/// [`send_message`](crate::Connection::send_message) /
/// [`send_file`](crate::Connection::send_file).
/// Receive-side errors terminate the read loop and are reported through
/// [`EventHandler::on_error`](crate::EventHandler::on_error) before the final
/// [`on_disconnect`](crate::EventHandler::on_disconnect).
/// Nothing is retried; once a connection has failed, a new one must be established.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection has reached its terminal state.
    /// All further send attempts fail with this error, deterministically.
    #[error("connection is closed")]
    Closed,

    /// The stream ended in the middle of a frame header or a length-prefixed
    /// field. Distinct from a graceful close, which is only recognised at a
    /// frame tag boundary.
    #[error("stream ended in the middle of a frame")]
    TruncatedFrame,

    /// The stream ended before a FILE frame's declared payload length was
    /// satisfied.
    #[error("file payload truncated: received {received} of {declared} bytes")]
    TruncatedTransfer {
        /// Payload length announced in the frame header
        declared: u64,
        /// Bytes actually received before the stream ended
        received: u64,
    },

    /// A length field exceeded the configured bound, or a payload was not
    /// valid UTF-8. Fatal: we refuse to allocate an attacker-controlled
    /// amount of memory or resynchronise after garbage.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// [`spawn_read_loop`](crate::Connection::spawn_read_loop) was called a
    /// second time. A connection has at most one receive loop.
    #[error("read loop is already running")]
    ReadLoopAlreadyRunning,

    /// Underlying transport or file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
