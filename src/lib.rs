//! Real-time detection stream client.
//!
//! Keeps a push connection to a remote classifier open, folds its prediction
//! messages and connection lifecycle into one coherent view, and recovers from
//! connection loss with capped exponential backoff.
//!
//! # Module Structure
//!
//! - `transport`: connection channels (WebSocket push, HTTP polling) running
//!   on worker threads and reporting generation-tagged events
//! - `prediction`: decoding raw messages into validated predictions
//! - `reconciler`: the state machine that owns `ViewState`
//! - `session`: binds a reconciler to a transport and its timers
//! - `frame_source`: the independently refreshing video feed
//! - `render`: pure view-to-output mapping
//! - `history`: read-only past detections

pub mod config;
pub mod error;
pub mod frame_source;
pub mod history;
pub mod prediction;
pub mod reconciler;
pub mod render;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, TransportKind};
pub use error::{ClientError, ClientResult, DecodeError, LifecycleMisuse, TransportError};
pub use frame_source::{FrameSource, FrameSourceConfig, FrameSourceHandle, FrameView};
pub use history::{render_history_table, HistoryClient, HistoryEntry};
pub use prediction::{decode, Prediction, RawMessage, ThreatStatus};
pub use reconciler::{
    Command, Reconciler, ReconcilerSettings, StreamEvent, StreamPhase, ViewState,
};
pub use render::{render, format_confidence, Indicator, VisualOutput};
pub use session::{SessionResources, StreamSession};
pub use transport::{
    ConnectionState, Generation, PollTransport, Transport, TransportEvent, TransportEventKind,
    WsTransport,
};
