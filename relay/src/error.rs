//! Error types for the individual relay components.
//!
//! Each component surfaces its own typed error so callers can decide what is fatal. The
//! orchestration layer (and the binaries) wrap these in [`eyre::Report`] with context.

use thiserror::Error;

/// Failures while exchanging an authorization code for an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token endpoint answered with a non-2xx status.
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// DNS, connect, timeout, or any other failure before a status was received.
    #[error("request error: {0}")]
    Transport(String),

    /// A 2xx response whose body is not a token.
    #[error("unexpected token response: {0}")]
    Decode(String),
}

/// Failures of the one-shot OAuth redirect listener.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("bind callback listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("timed out waiting for the authorization callback")]
    Timeout,

    #[error("callback listener exited without delivering a result")]
    Closed,

    #[error("callback did not carry an authorization code")]
    MissingCode,

    /// The `state` parameter did not match the CSRF token we generated.
    #[error("callback state does not match the CSRF token of this session")]
    StateMismatch,
}

/// The realtime channel endpoint could not be obtained.
#[derive(Debug, Error)]
pub enum ChannelResolutionError {
    #[error("request error: {0}")]
    Transport(String),

    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// The response did not contain `content.url`.
    #[error("malformed session auth response: {body}")]
    Malformed { body: String },
}

/// Failures of the realtime channel transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to realtime channel: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A single SYSTEM or CHAT payload could not be decoded.
///
/// Always local to the message it was raised for.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// The chat subscription call failed.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    #[error("request error: {0}")]
    Transport(String),

    /// No access token could be obtained for the subscribe call.
    #[error("obtain access token: {0}")]
    Auth(#[from] AuthError),
}

/// Failures of the durable message buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue {0} does not exist")]
    QueueMissing(String),

    #[error("invalid stored value: {0}")]
    Decode(String),
}

/// Configuration could not be loaded from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Failures that end a realtime session before or while it runs.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("resolve realtime channel endpoint: {0}")]
    Resolution(#[from] ChannelResolutionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
