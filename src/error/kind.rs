use thiserror::Error;

/**
 * Error taxonomy for the socket multiplexing engine.
 *
 * Kept as a typed enum (rather than an opaque `anyhow::Error`) because
 * callers branch on the kind: a subscribe that fails with
 * [`Error::CancellationRequested`] must still send an unsubscribe, while
 * other failures must not. Everything that doesn't need to be matched on
 * bubbles through `Transport` via anyhow's chaining, the same split the
 * REST sibling client uses between its own error kinds and
 * reqwest/serde errors.
 */
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted after the client entered `disposing`.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An authenticated subscribe/query was requested with no credentials configured.
    #[error("no credentials configured for an authenticated request")]
    NoCredentials,

    /// The transport never reached an open state.
    #[error("could not connect: {0}")]
    CantConnect(String),

    /// The transport dropped mid-operation; pending queries and subscriptions are affected.
    #[error("connection lost")]
    ConnectionLost,

    /// The caller cancelled, or a query timed out (timeouts and cancellation share this kind
    /// so that a leaked server-side subscription is always cleaned up the same way).
    #[error("cancellation requested")]
    CancellationRequested,

    /// The server signaled a failure for a request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Authentication failed during connect or reconnect; the connection is closed on this error.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// Anything else (transport I/O, JSON decode, URL parsing, ...) bubbles through here.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    pub fn cant_connect(reason: impl Into<String>) -> Self {
        Self::CantConnect(reason.into())
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError(message.into())
    }

    pub fn authentication_failed(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
            source,
        }
    }

    /// True when this failure should trigger a best-effort unsubscribe if it
    /// terminated a subscribe handshake.
    pub fn is_cancellation_or_timeout(&self) -> bool {
        matches!(self, Self::CancellationRequested)
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}
