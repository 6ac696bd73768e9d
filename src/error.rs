use thiserror::Error;

/// Reply status marking a successful call.
pub const STATUS_SUCCESS: &str = "success";

/// Errors that can occur during RPC operations.
///
/// The `Display` strings of [`RpcError::BadHandler`] and [`RpcError::NotFound`]
/// double as wire status tokens and must stay stable: peers compare them
/// verbatim.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No reply arrived within the per-call timeout.
    #[error("timeout")]
    Timeout,

    /// The caller's cancellation token fired before a reply arrived.
    #[error("context canceled")]
    Cancelled,

    /// The component is shutting down (or shut down) and accepts no calls.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting to the broker failed after exhausting the attempt budget.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server has no handler registered for the requested method.
    #[error("unregistered handler")]
    BadHandler,

    /// The remote side reported that the requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// The remote side replied with a status this protocol does not know.
    #[error("call status: {0}")]
    CallStatus(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker or transport level failure (publish, declare, ack).
    #[error("transport error: {0}")]
    Transport(String),

    /// Failure raised by a handler; the message is sent verbatim as the
    /// reply status.
    #[error("{0}")]
    Handler(String),

    /// Required configuration value is missing or malformed.
    #[error("missing config: {0}")]
    MissingConfig(String),
}

impl RpcError {
    /// Build a handler error from anything printable.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Self::Handler(msg.to_string())
    }

    /// Rehydrate a non-success reply status into an error value.
    ///
    /// Known tokens map onto their dedicated variants so calling code can
    /// branch on them; anything else is wrapped in [`RpcError::CallStatus`].
    pub fn from_status(status: &str) -> Self {
        // ---
        match status {
            s if s == Self::BadHandler.to_string() => Self::BadHandler,
            s if s == Self::NotFound.to_string() => Self::NotFound,
            other => Self::CallStatus(other.to_string()),
        }
    }

    /// Status token to place on a reply carrying this error.
    pub fn status(&self) -> String {
        self.to_string()
    }

    /// True for the distinguished "not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
