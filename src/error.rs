use thiserror::Error;

/// Result type for HEOS operations
pub type Result<T> = std::result::Result<T, HeosError>;

/// Errors that can occur when interacting with HEOS devices
#[derive(Error, Debug)]
pub enum HeosError {
    /// Command string was not of the form `group/command`
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// An argument was rejected before any network activity
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session has no live connection
    #[error("Not connected")]
    NotConnected,

    /// `connect` was called on a session that is already connected
    #[error("Session already connected")]
    AlreadyConnected,

    /// The session was closed and cannot be reused
    #[error("Session closed")]
    SessionClosed,

    /// Connection was closed while waiting for a response
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connect was cancelled before the socket was established
    #[error("Connect cancelled")]
    Cancelled,

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// Device answered a command with `result: fail`
    #[error("Command {command} failed: {message}")]
    CommandFailed {
        /// Command identity, `group/command`
        command: String,
        /// Raw failure message from the device
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}
