//! The error taxonomy used throughout the engine.
//!
//! All fallible public operations return [`EngineError`]. Event-loop callbacks
//! (peer-connection events, signaling pushes) never propagate an error up through
//! this type — they log and continue, per the policy in the engine's design notes.

/// Generic result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// `Join` attempted to negotiate before the publisher transport existed.
    /// Should be unreachable if `Configure` succeeded.
    #[error("no peer connection available for this operation")]
    NoPeerConnection,

    /// `WaitUntilConnected` (or `Join`) exceeded the configured join timeout.
    #[error("timed out waiting for connection after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// A publish was attempted with no matching data channel present.
    #[error("data channel not found for {0:?}")]
    DataChannelNotFound(crate::data_plane::DataPacketKind),

    /// Surfaced from the signaling client.
    #[error("signaling error: {0}")]
    SignalingError(String),

    /// SDP apply/create failures. Propagated to the caller from facade operations;
    /// logged-and-tolerated when encountered inside event callbacks.
    #[error("negotiation error: {0}")]
    NegotiationError(String),

    /// Ten reconnect attempts failed, or backoff exceeded its cap.
    #[error("reconnection exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The engine has already been closed.
    #[error("engine is closed")]
    Closed,

    /// `Join`'s cancellation token fired before the signaling join completed.
    #[error("join cancelled")]
    Cancelled,

    /// Failed to encode or decode a protocol message.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A fundamental networking error surfaced from a lower layer.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Anything that doesn't cleanly fit the categories above.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerializationError(value.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(value: Box<bincode::ErrorKind>) -> Self {
        Self::SerializationError(value.to_string())
    }
}
