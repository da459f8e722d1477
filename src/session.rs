//! A mounted stream client.
//!
//! `StreamSession` is the scoped owner of everything a mounted client
//! acquires: the transport connection, the retry timer and the staleness
//! timer, held together in `SessionResources` and released by one call.
//!
//! The session runs on the caller's thread. `pump` waits for the next
//! transport event or timer deadline, feeds it through the reconciler and
//! executes the resulting commands. Nothing else writes the view.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::reconciler::{Command, Reconciler, ReconcilerSettings, StreamEvent, ViewState};
use crate::transport::{EventSink, Generation, OpenOutcome, Transport, TransportEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RetryTimer {
    due: Instant,
    generation: Generation,
}

/// Connection plus both timers. `release` cancels the timers and closes the
/// connection; afterwards no timer is pending and the transport is idle.
pub struct SessionResources {
    transport: Box<dyn Transport>,
    retry: Option<RetryTimer>,
    staleness: Option<Instant>,
}

impl SessionResources {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            retry: None,
            staleness: None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.retry.map(|timer| timer.due), self.staleness) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn has_pending_timers(&self) -> bool {
        self.retry.is_some() || self.staleness.is_some()
    }

    fn release(&mut self) {
        self.retry = None;
        self.staleness = None;
        self.transport.close();
    }
}

pub struct StreamSession {
    reconciler: Reconciler,
    resources: SessionResources,
    sink: EventSink,
    events: mpsc::Receiver<TransportEvent>,
    released: bool,
}

impl StreamSession {
    /// Create the view and start the first connection attempt.
    pub fn mount(
        settings: ReconcilerSettings,
        transport: Box<dyn Transport>,
    ) -> ClientResult<Self> {
        let (sink, events) = mpsc::channel();
        let now = Instant::now();
        let mut session = Self {
            reconciler: Reconciler::new(settings, now),
            resources: SessionResources::new(transport),
            sink,
            events,
            released: false,
        };
        session.dispatch(StreamEvent::Mount, now)?;
        Ok(session)
    }

    /// Mount with the transport selected by `config`.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::mount(config.reconciler_settings(), config.build_transport())
    }

    pub fn view(&self) -> &ViewState {
        self.reconciler.view()
    }

    /// Owned copy of the current view for observers.
    pub fn snapshot(&self) -> ViewState {
        self.reconciler.view().clone()
    }

    pub fn revision(&self) -> u64 {
        self.reconciler.view().revision
    }

    pub fn transport_name(&self) -> &'static str {
        self.resources.transport.name()
    }

    pub fn endpoint(&self) -> &str {
        self.resources.transport.endpoint()
    }

    pub fn resources(&self) -> &SessionResources {
        &self.resources
    }

    /// Process everything that is ready, waiting at most `max_wait` for the
    /// next event or timer. Returns true when the view changed.
    pub fn pump(&mut self, max_wait: Duration) -> ClientResult<bool> {
        let revision = self.revision();
        let now = Instant::now();
        self.fire_due_timers(now)?;

        let wait = self
            .resources
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now).min(max_wait))
            .unwrap_or(max_wait);
        match self.events.recv_timeout(wait) {
            Ok(event) => {
                self.dispatch(event.into(), Instant::now())?;
                while let Ok(event) = self.events.try_recv() {
                    self.dispatch(event.into(), Instant::now())?;
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        self.fire_due_timers(Instant::now())?;
        Ok(self.revision() != revision)
    }

    /// Skip the remaining backoff and reconnect immediately.
    pub fn reconnect_now(&mut self) -> ClientResult<()> {
        self.dispatch(StreamEvent::Reconnect, Instant::now())
    }

    /// Tear down: cancel both timers, close the connection, and return the final view.
    pub fn unmount(mut self) -> ViewState {
        self.teardown();
        self.reconciler.view().clone()
    }

    fn teardown(&mut self) {
        if self.released {
            return;
        }
        let now = Instant::now();
        if let Err(e) = self.dispatch(StreamEvent::Unmount, now) {
            log::error!("unmount failed: {}", e);
        }
        self.resources.release();
        let dropped = self.events.try_iter().count();
        if dropped > 0 {
            log::debug!("discarded {} transport events at teardown", dropped);
        }
        self.released = true;
    }

    fn fire_due_timers(&mut self, now: Instant) -> ClientResult<()> {
        if let Some(timer) = self.resources.retry {
            if timer.due <= now {
                self.resources.retry = None;
                self.dispatch(
                    StreamEvent::RetryElapsed {
                        generation: timer.generation,
                    },
                    now,
                )?;
            }
        }
        if let Some(deadline) = self.resources.staleness {
            if deadline <= now {
                self.resources.staleness = None;
                self.dispatch(StreamEvent::StalenessCheck, now)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: StreamEvent, now: Instant) -> ClientResult<()> {
        let commands = self.reconciler.handle(event, now).map_err(|misuse| {
            log::error!("lifecycle misuse: {}", misuse);
            misuse
        })?;
        for command in commands {
            self.execute(command, now);
        }
        Ok(())
    }

    fn execute(&mut self, command: Command, now: Instant) {
        match command {
            Command::Open(generation) => {
                let outcome = self.resources.transport.open(generation, self.sink.clone());
                if outcome == OpenOutcome::AlreadyActive {
                    log::warn!(
                        "{} transport still {} when opening {}",
                        self.resources.transport.name(),
                        self.resources.transport.state().as_str(),
                        generation
                    );
                }
            }
            Command::Close(_) => self.resources.transport.close(),
            Command::ScheduleRetry { generation, delay } => {
                self.resources.retry = Some(RetryTimer {
                    due: now + delay,
                    generation,
                });
            }
            Command::CancelRetry => self.resources.retry = None,
            Command::ArmStaleness { deadline } => self.resources.staleness = Some(deadline),
            Command::CancelStaleness => self.resources.staleness = None,
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
