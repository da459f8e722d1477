//! Transport channel to the inference backend.
//!
//! A transport owns at most one live connection. Each connection attempt is
//! tagged with a `Generation` chosen by the reconciler; every event a
//! connection emits carries that tag so superseded connections can be fenced.
//!
//! - `WsTransport`: push connection (`ws://host/ws`), one JSON record per message.
//! - `PollTransport`: `GET http://host/predict` on a fixed cadence.
//!
//! Transports never propagate decode problems; payloads are forwarded as
//! opaque `RawMessage`s and interpreted by the reconciler.

mod poll;
mod websocket;
mod worker;

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::prediction::RawMessage;

pub use poll::{PollSettings, PollTransport};
pub use websocket::{WsSettings, WsTransport};

/// Monotonic tag for a connection attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub const NONE: Generation = Generation(0);

    pub fn new(value: u64) -> Self {
        Generation(value)
    }

    pub fn next(self) -> Self {
        Generation(self.0.saturating_add(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// True while a connection attempt is in flight or established.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEventKind {
    Opened,
    Message(RawMessage),
    Error(TransportError),
    /// Remote or network close. Carries the close code when the peer sent one.
    Closed(Option<u16>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportEvent {
    pub generation: Generation,
    pub kind: TransportEventKind,
}

pub type EventSink = mpsc::Sender<TransportEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new connection attempt was started.
    Started,
    /// A connection is already connecting or connected; nothing was done.
    AlreadyActive,
}

/// Transport channel seam.
///
/// Implementations must:
/// - start at most one connection at a time (`open` is idempotent while active)
/// - never block the caller in `open`; the outcome arrives as an `Opened` or `Error` event
/// - deliver no event for a connection once `close` has returned
pub trait Transport: Send {
    /// Transport identifier for logs.
    fn name(&self) -> &'static str;

    /// Endpoint this transport connects to.
    fn endpoint(&self) -> &str;

    fn state(&self) -> ConnectionState;

    fn open(&mut self, generation: Generation, sink: EventSink) -> OpenOutcome;

    /// Close the current connection, if any, and wait for its worker to exit.
    fn close(&mut self);
}

/// Connection state shared between a transport and its worker thread.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionCell {
    inner: Arc<Mutex<ConnectionState>>,
}

impl ConnectionCell {
    pub(crate) fn get(&self) -> ConnectionState {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_are_monotonic() {
        let first = Generation::NONE.next();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.get(), 2);
        assert_eq!(second.to_string(), "gen#2");
        assert_eq!(Generation::new(u64::MAX).next().get(), u64::MAX);
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Closing.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }

    #[test]
    fn connection_cell_is_shared() {
        let cell = ConnectionCell::default();
        let clone = cell.clone();
        clone.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }
}
