//! Error taxonomy for the stream client.
//!
//! - `DecodeError`: a payload could not be read as a record. Recoverable; the
//!   message is dropped and the view is left untouched.
//! - `TransportError`: the push connection failed. Recoverable; drives the
//!   backoff retry path.
//! - `LifecycleMisuse`: the caller drove the client out of order. This is a
//!   usage bug and is surfaced as an `Err`, never swallowed.
//!
//! Only `LifecycleMisuse` ever escapes the reconciler, so it is the only
//! source of `ClientError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is a json {0}, expected an object")]
    NotARecord(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },
    #[error("connection i/o error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleMisuse {
    #[error("mount requested after the stream was terminated")]
    MountAfterTerminate,
    #[error("reconnect requested after the stream was terminated")]
    ReconnectAfterTerminate,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleMisuse),
}

pub type ClientResult<T> = Result<T, ClientError>;
