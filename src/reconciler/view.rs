use std::fmt;
use std::time::{Duration, Instant};

use crate::prediction::Prediction;
use crate::transport::{ConnectionState, Generation};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Connecting,
    Live,
    Stalled,
    Retrying,
    Terminated,
}

impl StreamPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamPhase::Idle => "idle",
            StreamPhase::Connecting => "connecting",
            StreamPhase::Live => "live",
            StreamPhase::Stalled => "stalled",
            StreamPhase::Retrying => "retrying",
            StreamPhase::Terminated => "terminated",
        }
    }

    /// Live or Stalled: a connection is up and predictions are accepted.
    pub fn accepts_predictions(&self) -> bool {
        matches!(self, StreamPhase::Live | StreamPhase::Stalled)
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPlan {
    /// 1-based reconnect attempt number since the last successful connection.
    pub attempt: u32,
    pub delay: Duration,
}

/// The single coherent view of the stream. Written only by the reconciler.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewState {
    pub phase: StreamPhase,
    pub connection: ConnectionState,
    pub last_prediction: Option<Prediction>,
    /// Time of the last prediction, or of the last (re)connection when newer.
    pub last_updated_at: Instant,
    pub is_stale: bool,
    pub generation: Generation,
    pub retry: Option<RetryPlan>,
    /// Bumped on every mutation; lets observers skip unchanged snapshots.
    pub revision: u64,
}

impl ViewState {
    pub(crate) fn mounted_at(now: Instant) -> Self {
        Self {
            phase: StreamPhase::Idle,
            connection: ConnectionState::Disconnected,
            last_prediction: None,
            last_updated_at: now,
            is_stale: false,
            generation: Generation::NONE,
            retry: None,
            revision: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == StreamPhase::Terminated
    }
}
