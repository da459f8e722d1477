//! Stream reconciler.
//!
//! Merges connection lifecycle events, decoded predictions and timer expiries
//! into one `ViewState`. Every input goes through `Reconciler::handle`, which
//! mutates the view and returns the side effects the owner must perform
//! (open/close the transport, arm/cancel timers). The reconciler itself does
//! no I/O and reads no clock; `now` is supplied by the caller.
//!
//! Phases:
//!
//! ```text
//! Idle -> Connecting -> Live <-> Stalled
//!             ^          |         |
//!             |          v         v
//!             +------ Retrying <---+
//! any -> Terminated
//! ```
//!
//! Connection attempts are tagged with a `Generation`. Events whose generation
//! differs from the current attempt are dropped, as are predictions that
//! arrive outside Live/Stalled.

mod backoff;
mod view;

use std::time::{Duration, Instant};

use crate::error::LifecycleMisuse;
use crate::prediction::decode;
use crate::transport::{ConnectionState, Generation, TransportEvent, TransportEventKind};

pub use backoff::{Backoff, BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CEILING};
pub use view::{RetryPlan, StreamPhase, ViewState};

pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(10);

/// Added to staleness deadlines so a check at the deadline sees `elapsed > window`.
const STALENESS_RESOLUTION: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerSettings {
    pub staleness_window: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            staleness_window: DEFAULT_STALENESS_WINDOW,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Mount,
    Transport(TransportEvent),
    StalenessCheck,
    RetryElapsed { generation: Generation },
    /// Explicit user request to skip the remaining backoff.
    Reconnect,
    Unmount,
}

impl From<TransportEvent> for StreamEvent {
    fn from(event: TransportEvent) -> Self {
        StreamEvent::Transport(event)
    }
}

/// Side effect requested by a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Open(Generation),
    Close(Generation),
    ScheduleRetry {
        generation: Generation,
        delay: Duration,
    },
    CancelRetry,
    ArmStaleness {
        deadline: Instant,
    },
    CancelStaleness,
}

pub struct Reconciler {
    settings: ReconcilerSettings,
    view: ViewState,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(settings: ReconcilerSettings, now: Instant) -> Self {
        let backoff = Backoff::new(settings.backoff.clone());
        Self {
            settings,
            view: ViewState::mounted_at(now),
            backoff,
        }
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn phase(&self) -> StreamPhase {
        self.view.phase
    }

    /// Apply one event. Returns the commands the owner must execute, in order.
    ///
    /// After `Terminated`, every event except an explicit `Mount`/`Reconnect`
    /// is ignored; those two are lifecycle misuse.
    pub fn handle(
        &mut self,
        event: StreamEvent,
        now: Instant,
    ) -> Result<Vec<Command>, LifecycleMisuse> {
        if self.view.phase == StreamPhase::Terminated {
            return match event {
                StreamEvent::Mount => Err(LifecycleMisuse::MountAfterTerminate),
                StreamEvent::Reconnect => Err(LifecycleMisuse::ReconnectAfterTerminate),
                _ => Ok(Vec::new()),
            };
        }

        let commands = match event {
            StreamEvent::Mount => self.on_mount(),
            StreamEvent::Transport(event) => self.on_transport(event, now),
            StreamEvent::StalenessCheck => self.on_staleness_check(now),
            StreamEvent::RetryElapsed { generation } => self.on_retry_elapsed(generation),
            StreamEvent::Reconnect => self.on_reconnect(),
            StreamEvent::Unmount => self.on_unmount(),
        };
        Ok(commands)
    }

    fn on_mount(&mut self) -> Vec<Command> {
        if self.view.phase != StreamPhase::Idle {
            log::debug!("mount ignored: stream already {}", self.view.phase);
            return Vec::new();
        }
        self.begin_attempt()
    }

    fn begin_attempt(&mut self) -> Vec<Command> {
        let generation = self.view.generation.next();
        self.view.generation = generation;
        self.view.phase = StreamPhase::Connecting;
        self.view.connection = ConnectionState::Connecting;
        self.view.is_stale = false;
        self.view.retry = None;
        self.touch();
        log::info!("stream {} connecting", generation);
        vec![Command::Open(generation)]
    }

    fn on_transport(&mut self, event: TransportEvent, now: Instant) -> Vec<Command> {
        if event.generation != self.view.generation {
            log::debug!(
                "dropping {} from superseded {} (current {})",
                kind_name(&event.kind),
                event.generation,
                self.view.generation
            );
            return Vec::new();
        }
        match event.kind {
            TransportEventKind::Opened => self.on_opened(now),
            TransportEventKind::Message(raw) => {
                if !self.view.phase.accepts_predictions() {
                    log::debug!(
                        "dropping message for {} while {}",
                        event.generation,
                        self.view.phase
                    );
                    return Vec::new();
                }
                match decode(&raw) {
                    Ok(prediction) => {
                        let resumed = self.view.phase == StreamPhase::Stalled;
                        self.view.last_prediction = Some(prediction);
                        self.view.last_updated_at = now;
                        self.view.is_stale = false;
                        self.view.phase = StreamPhase::Live;
                        self.touch();
                        if resumed {
                            log::info!("stream {} resumed", event.generation);
                            vec![self.arm_staleness()]
                        } else {
                            Vec::new()
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "dropping undecodable message ({} bytes) on {}: {}",
                            raw.len(),
                            event.generation,
                            e
                        );
                        Vec::new()
                    }
                }
            }
            TransportEventKind::Error(cause) => self.on_connection_lost(&cause.to_string()),
            TransportEventKind::Closed(code) => {
                let reason = match code {
                    Some(code) => format!("closed by peer with code {}", code),
                    None => "closed by peer".to_string(),
                };
                self.on_connection_lost(&reason)
            }
        }
    }

    fn on_opened(&mut self, now: Instant) -> Vec<Command> {
        if self.view.phase != StreamPhase::Connecting {
            log::debug!("ignoring open confirmation while {}", self.view.phase);
            return Vec::new();
        }
        self.view.phase = StreamPhase::Live;
        self.view.connection = ConnectionState::Connected;
        self.view.is_stale = false;
        self.view.retry = None;
        self.view.last_updated_at = now;
        self.backoff.reset();
        self.touch();
        log::info!("stream {} live", self.view.generation);
        vec![self.arm_staleness()]
    }

    fn on_connection_lost(&mut self, reason: &str) -> Vec<Command> {
        if !matches!(
            self.view.phase,
            StreamPhase::Connecting | StreamPhase::Live | StreamPhase::Stalled
        ) {
            return Vec::new();
        }
        let generation = self.view.generation;
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.view.phase = StreamPhase::Retrying;
        self.view.connection = ConnectionState::Disconnected;
        self.view.is_stale = false;
        self.view.retry = Some(RetryPlan { attempt, delay });
        self.touch();
        log::warn!(
            "stream {} lost: {}; reconnect #{} in {}ms",
            generation,
            reason,
            attempt,
            delay.as_millis()
        );
        vec![
            Command::CancelStaleness,
            Command::Close(generation),
            Command::ScheduleRetry { generation, delay },
        ]
    }

    fn on_staleness_check(&mut self, now: Instant) -> Vec<Command> {
        if self.view.phase != StreamPhase::Live
            || self.view.connection != ConnectionState::Connected
        {
            return Vec::new();
        }
        let silent_for = now.saturating_duration_since(self.view.last_updated_at);
        if silent_for > self.settings.staleness_window {
            self.view.is_stale = true;
            self.view.phase = StreamPhase::Stalled;
            self.touch();
            log::warn!(
                "stream {} stalled: no prediction for {}ms",
                self.view.generation,
                silent_for.as_millis()
            );
            return Vec::new();
        }
        vec![self.arm_staleness()]
    }

    fn on_retry_elapsed(&mut self, generation: Generation) -> Vec<Command> {
        if self.view.phase != StreamPhase::Retrying || generation != self.view.generation {
            log::debug!("ignoring retry timer for {}", generation);
            return Vec::new();
        }
        self.begin_attempt()
    }

    fn on_reconnect(&mut self) -> Vec<Command> {
        match self.view.phase {
            StreamPhase::Retrying => {
                let mut commands = vec![Command::CancelRetry];
                commands.extend(self.begin_attempt());
                commands
            }
            StreamPhase::Idle => self.begin_attempt(),
            _ => Vec::new(),
        }
    }

    fn on_unmount(&mut self) -> Vec<Command> {
        let generation = self.view.generation;
        self.view.phase = StreamPhase::Terminated;
        self.view.connection = ConnectionState::Disconnected;
        self.view.is_stale = false;
        self.view.retry = None;
        self.touch();
        log::info!("stream {} terminated", generation);
        vec![
            Command::CancelRetry,
            Command::CancelStaleness,
            Command::Close(generation),
        ]
    }

    fn arm_staleness(&self) -> Command {
        Command::ArmStaleness {
            deadline: self.view.last_updated_at
                + self.settings.staleness_window
                + STALENESS_RESOLUTION,
        }
    }

    fn touch(&mut self) {
        self.view.revision = self.view.revision.wrapping_add(1);
    }
}

fn kind_name(kind: &TransportEventKind) -> &'static str {
    match kind {
        TransportEventKind::Opened => "open",
        TransportEventKind::Message(_) => "message",
        TransportEventKind::Error(_) => "error",
        TransportEventKind::Closed(_) => "close",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::prediction::{RawMessage, ThreatStatus};

    const WINDOW: Duration = Duration::from_secs(10);

    fn reconciler(start: Instant) -> Reconciler {
        Reconciler::new(
            ReconcilerSettings {
                staleness_window: WINDOW,
                backoff: BackoffPolicy::default(),
            },
            start,
        )
    }

    fn transport(generation: Generation, kind: TransportEventKind) -> StreamEvent {
        StreamEvent::Transport(TransportEvent { generation, kind })
    }

    fn message(generation: Generation, payload: &str) -> StreamEvent {
        transport(
            generation,
            TransportEventKind::Message(RawMessage::from(payload)),
        )
    }

    fn live(start: Instant) -> Reconciler {
        let mut r = reconciler(start);
        r.handle(StreamEvent::Mount, start).expect("mount");
        r.handle(transport(Generation::new(1), TransportEventKind::Opened), start)
            .expect("opened");
        assert_eq!(r.phase(), StreamPhase::Live);
        r
    }

    #[test]
    fn mount_opens_first_generation() {
        let start = Instant::now();
        let mut r = reconciler(start);
        assert_eq!(r.phase(), StreamPhase::Idle);
        assert_eq!(r.view().connection, ConnectionState::Disconnected);
        assert!(r.view().last_prediction.is_none());

        let commands = r.handle(StreamEvent::Mount, start).expect("mount");
        assert_eq!(commands, vec![Command::Open(Generation::new(1))]);
        assert_eq!(r.phase(), StreamPhase::Connecting);
        assert_eq!(r.view().connection, ConnectionState::Connecting);

        // A second mount does not start another connection.
        assert!(r.handle(StreamEvent::Mount, start).expect("mount").is_empty());
    }

    #[test]
    fn open_confirmation_goes_live_and_arms_staleness() {
        let start = Instant::now();
        let mut r = reconciler(start);
        r.handle(StreamEvent::Mount, start).expect("mount");
        let commands = r
            .handle(transport(Generation::new(1), TransportEventKind::Opened), start)
            .expect("opened");
        assert_eq!(
            commands,
            vec![Command::ArmStaleness {
                deadline: start + WINDOW + STALENESS_RESOLUTION
            }]
        );
        assert_eq!(r.view().connection, ConnectionState::Connected);
        assert!(!r.view().is_stale);
    }

    #[test]
    fn predictions_replace_last_prediction_without_commands() {
        let start = Instant::now();
        let mut r = live(start);
        let at = start + Duration::from_secs(2);
        let commands = r
            .handle(
                message(Generation::new(1), r#"{"label":"person","confidence":0.92,"threat_status":"Threat"}"#),
                at,
            )
            .expect("message");
        assert!(commands.is_empty());
        let prediction = r.view().last_prediction.clone().expect("prediction");
        assert_eq!(prediction.label(), "person");
        assert_eq!(prediction.threat_status(), ThreatStatus::Threat);
        assert_eq!(r.view().last_updated_at, at);

        r.handle(message(Generation::new(1), r#"{"label":"cat"}"#), at)
            .expect("message");
        assert_eq!(
            r.view().last_prediction.as_ref().map(|p| p.label()),
            Some("cat")
        );
    }

    #[test]
    fn undecodable_message_leaves_view_unchanged() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(message(Generation::new(1), r#"{"label":"dog"}"#), start)
            .expect("message");
        let before = r.view().clone();
        let commands = r
            .handle(message(Generation::new(1), "<<garbage>>"), start + WINDOW)
            .expect("message");
        assert!(commands.is_empty());
        assert_eq!(r.view(), &before);
    }

    #[test]
    fn staleness_flips_once_and_clears_on_prediction() {
        let start = Instant::now();
        let mut r = live(start);

        let early = r
            .handle(StreamEvent::StalenessCheck, start + Duration::from_secs(5))
            .expect("check");
        assert!(matches!(early.as_slice(), [Command::ArmStaleness { .. }]));
        assert!(!r.view().is_stale);

        let late = start + WINDOW + Duration::from_secs(1);
        assert!(r
            .handle(StreamEvent::StalenessCheck, late)
            .expect("check")
            .is_empty());
        assert!(r.view().is_stale);
        assert_eq!(r.phase(), StreamPhase::Stalled);
        assert_eq!(r.view().connection, ConnectionState::Connected);

        let revision = r.view().revision;
        r.handle(StreamEvent::StalenessCheck, late + WINDOW)
            .expect("check");
        assert_eq!(r.view().revision, revision, "stale flagged only once");

        let resumed_at = late + Duration::from_secs(1);
        let commands = r
            .handle(message(Generation::new(1), r#"{"label":"person"}"#), resumed_at)
            .expect("message");
        assert!(!r.view().is_stale);
        assert_eq!(r.phase(), StreamPhase::Live);
        assert_eq!(
            commands,
            vec![Command::ArmStaleness {
                deadline: resumed_at + WINDOW + STALENESS_RESOLUTION
            }]
        );
    }

    #[test]
    fn staleness_check_exactly_at_window_is_not_stale() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(StreamEvent::StalenessCheck, start + WINDOW)
            .expect("check");
        assert!(!r.view().is_stale);
    }

    #[test]
    fn connection_error_schedules_backoff_retry() {
        let start = Instant::now();
        let mut r = live(start);
        let commands = r
            .handle(
                transport(
                    Generation::new(1),
                    TransportEventKind::Error(TransportError::Io("reset".into())),
                ),
                start,
            )
            .expect("error");
        assert_eq!(
            commands,
            vec![
                Command::CancelStaleness,
                Command::Close(Generation::new(1)),
                Command::ScheduleRetry {
                    generation: Generation::new(1),
                    delay: Duration::from_secs(1)
                },
            ]
        );
        assert_eq!(r.phase(), StreamPhase::Retrying);
        assert_eq!(r.view().connection, ConnectionState::Disconnected);
        assert_eq!(
            r.view().retry,
            Some(RetryPlan {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );

        // A trailing close for the same connection does not schedule a second retry.
        assert!(r
            .handle(transport(Generation::new(1), TransportEventKind::Closed(None)), start)
            .expect("close")
            .is_empty());
    }

    #[test]
    fn backoff_grows_across_failed_attempts_and_resets_on_live() {
        let start = Instant::now();
        let mut r = reconciler(start);
        r.handle(StreamEvent::Mount, start).expect("mount");

        let mut delays = Vec::new();
        for _ in 0..4 {
            let generation = r.view().generation;
            let commands = r
                .handle(
                    transport(
                        generation,
                        TransportEventKind::Error(TransportError::Io("refused".into())),
                    ),
                    start,
                )
                .expect("error");
            let Some(Command::ScheduleRetry { delay, .. }) = commands.last().cloned() else {
                panic!("no retry scheduled: {:?}", commands);
            };
            delays.push(delay.as_secs());
            let commands = r
                .handle(StreamEvent::RetryElapsed { generation }, start)
                .expect("retry");
            assert_eq!(commands, vec![Command::Open(generation.next())]);
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);

        let generation = r.view().generation;
        r.handle(transport(generation, TransportEventKind::Opened), start)
            .expect("opened");
        let commands = r
            .handle(transport(generation, TransportEventKind::Closed(Some(1006))), start)
            .expect("close");
        assert!(commands.contains(&Command::ScheduleRetry {
            generation,
            delay: Duration::from_secs(1)
        }));
    }

    #[test]
    fn superseded_generation_is_fenced() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(
            transport(Generation::new(1), TransportEventKind::Closed(None)),
            start,
        )
        .expect("close");
        r.handle(
            StreamEvent::RetryElapsed {
                generation: Generation::new(1),
            },
            start,
        )
        .expect("retry");
        assert_eq!(r.view().generation, Generation::new(2));
        assert_eq!(r.phase(), StreamPhase::Connecting);

        let before = r.view().clone();
        r.handle(message(Generation::new(1), r#"{"label":"ghost"}"#), start)
            .expect("message");
        r.handle(transport(Generation::new(1), TransportEventKind::Opened), start)
            .expect("opened");
        r.handle(
            transport(
                Generation::new(1),
                TransportEventKind::Error(TransportError::Io("late".into())),
            ),
            start,
        )
        .expect("error");
        assert_eq!(r.view(), &before);
    }

    #[test]
    fn stale_retry_timer_is_ignored() {
        let start = Instant::now();
        let mut r = live(start);
        assert!(r
            .handle(
                StreamEvent::RetryElapsed {
                    generation: Generation::new(1)
                },
                start
            )
            .expect("retry")
            .is_empty());
        assert_eq!(r.phase(), StreamPhase::Live);
    }

    #[test]
    fn reconnect_skips_backoff() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(
            transport(Generation::new(1), TransportEventKind::Closed(None)),
            start,
        )
        .expect("close");
        let commands = r.handle(StreamEvent::Reconnect, start).expect("reconnect");
        assert_eq!(
            commands,
            vec![Command::CancelRetry, Command::Open(Generation::new(2))]
        );
        assert!(r
            .handle(StreamEvent::Reconnect, start)
            .expect("reconnect")
            .is_empty());
    }

    #[test]
    fn unmount_terminates_and_releases_everything() {
        let start = Instant::now();
        let mut r = live(start);
        let commands = r.handle(StreamEvent::Unmount, start).expect("unmount");
        assert_eq!(
            commands,
            vec![
                Command::CancelRetry,
                Command::CancelStaleness,
                Command::Close(Generation::new(1)),
            ]
        );
        assert!(r.view().is_terminated());
        assert_eq!(r.view().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn nothing_mutates_after_termination() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(StreamEvent::Unmount, start).expect("unmount");
        let before = r.view().clone();

        let late = start + WINDOW * 3;
        for event in [
            message(Generation::new(1), r#"{"label":"person"}"#),
            transport(Generation::new(1), TransportEventKind::Opened),
            transport(Generation::new(1), TransportEventKind::Closed(None)),
            StreamEvent::StalenessCheck,
            StreamEvent::RetryElapsed {
                generation: Generation::new(1),
            },
            StreamEvent::Unmount,
        ] {
            assert!(r.handle(event, late).expect("ignored").is_empty());
        }
        assert_eq!(r.view(), &before);
    }

    #[test]
    fn mount_after_termination_is_misuse() {
        let start = Instant::now();
        let mut r = live(start);
        r.handle(StreamEvent::Unmount, start).expect("unmount");
        assert_eq!(
            r.handle(StreamEvent::Mount, start),
            Err(LifecycleMisuse::MountAfterTerminate)
        );
        assert_eq!(
            r.handle(StreamEvent::Reconnect, start),
            Err(LifecycleMisuse::ReconnectAfterTerminate)
        );
    }

    #[test]
    fn message_before_open_confirmation_is_dropped() {
        let start = Instant::now();
        let mut r = reconciler(start);
        r.handle(StreamEvent::Mount, start).expect("mount");
        r.handle(message(Generation::new(1), r#"{"label":"early"}"#), start)
            .expect("message");
        assert!(r.view().last_prediction.is_none());
    }
}
