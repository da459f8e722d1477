//! Polling transport (`GET http://host/predict` on a fixed cadence).
//!
//! Maps HTTP polling onto the same event contract as the push transport:
//! - first reachable response: `Opened`
//! - each 2xx body: `Message`
//! - non-2xx status: backend reachable but nothing to report, no event
//! - network failure: `Error`, and the connection ends

use std::time::Duration;

use super::worker::{ConnectionTask, ConnectionWorker};
use super::{
    ConnectionCell, ConnectionState, EventSink, Generation, OpenOutcome, Transport,
    TransportEvent, TransportEventKind,
};
use crate::error::TransportError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub struct PollTransport {
    endpoint: String,
    settings: PollSettings,
    agent: ureq::Agent,
    state: ConnectionCell,
    worker: Option<ConnectionWorker>,
}

impl PollTransport {
    pub fn new(endpoint: impl Into<String>, settings: PollSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.request_timeout)
            .timeout(settings.request_timeout)
            .build();
        Self {
            endpoint: endpoint.into(),
            settings,
            agent,
            state: ConnectionCell::default(),
            worker: None,
        }
    }
}

impl Transport for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn open(&mut self, generation: Generation, sink: EventSink) -> OpenOutcome {
        if self.state.get().is_active() {
            return OpenOutcome::AlreadyActive;
        }
        if let Some(mut finished) = self.worker.take() {
            finished.shutdown();
        }

        self.state.set(ConnectionState::Connecting);
        let poller = Poller {
            endpoint: self.endpoint.clone(),
            interval: self.settings.interval,
            agent: self.agent.clone(),
            state: self.state.clone(),
        };
        match ConnectionWorker::spawn("poll-conn", generation, sink.clone(), move |task| {
            poller.run(task)
        }) {
            Ok(worker) => {
                log::info!(
                    "poll {} polling {} every {}ms",
                    generation,
                    self.endpoint,
                    self.settings.interval.as_millis()
                );
                self.worker = Some(worker);
            }
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                let _ = sink.send(TransportEvent {
                    generation,
                    kind: TransportEventKind::Error(TransportError::Io(format!(
                        "spawn poll worker: {}",
                        e
                    ))),
                });
            }
        }
        OpenOutcome::Started
    }

    fn close(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        if !worker.is_finished() {
            self.state.set(ConnectionState::Closing);
        }
        worker.shutdown();
        self.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Poller {
    endpoint: String,
    interval: Duration,
    agent: ureq::Agent,
    state: ConnectionCell,
}

impl Poller {
    fn run(self, task: ConnectionTask) {
        let mut opened = false;
        loop {
            if task.should_stop() {
                return;
            }
            match self.fetch() {
                Ok(Some(body)) => {
                    if !opened {
                        opened = self.mark_open(&task);
                    }
                    task.emit(TransportEventKind::Message(body.into()));
                }
                Ok(None) => {
                    if !opened {
                        opened = self.mark_open(&task);
                    }
                }
                Err(e) => {
                    self.state.set(ConnectionState::Disconnected);
                    task.emit(TransportEventKind::Error(e));
                    return;
                }
            }
            if task.wait(self.interval) {
                return;
            }
        }
    }

    fn mark_open(&self, task: &ConnectionTask) -> bool {
        self.state.set(ConnectionState::Connected);
        task.emit(TransportEventKind::Opened);
        true
    }

    fn fetch(&self) -> Result<Option<String>, TransportError> {
        match self.agent.get(&self.endpoint).call() {
            Ok(response) => response
                .into_string()
                .map(Some)
                .map_err(|e| TransportError::Io(format!("read poll response: {}", e))),
            Err(ureq::Error::Status(code, _)) => {
                log::debug!("poll {} returned status {}", self.endpoint, code);
                Ok(None)
            }
            Err(ureq::Error::Transport(e)) => Err(TransportError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn serve_json_once_per_connection(listener: TcpListener, body: &'static str) {
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut line = String::new();
                while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
                    if line == "\r\n" {
                        break;
                    }
                    line.clear();
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
    }

    #[test]
    fn polls_and_forwards_bodies() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        serve_json_once_per_connection(
            listener,
            r#"{"label":"person","confidence":0.5,"threat_status":"Normal"}"#,
        );

        let (sink, events) = mpsc::channel();
        let mut transport = PollTransport::new(
            format!("http://{}/predict", addr),
            PollSettings {
                interval: Duration::from_millis(50),
                request_timeout: Duration::from_secs(2),
            },
        );
        assert_eq!(transport.open(Generation::new(7), sink.clone()), OpenOutcome::Started);
        assert_eq!(transport.open(Generation::new(7), sink), OpenOutcome::AlreadyActive);

        let first = events
            .recv_timeout(Duration::from_secs(5))
            .expect("opened event");
        assert_eq!(first.generation, Generation::new(7));
        assert_eq!(first.kind, TransportEventKind::Opened);
        let second = events
            .recv_timeout(Duration::from_secs(5))
            .expect("message event");
        assert!(matches!(second.kind, TransportEventKind::Message(_)));

        transport.close();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        let _: Vec<_> = events.try_iter().collect();
        std::thread::sleep(Duration::from_millis(150));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unreachable_backend_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let (sink, events) = mpsc::channel();
        let mut transport = PollTransport::new(
            format!("http://{}/predict", addr),
            PollSettings::default(),
        );
        transport.open(Generation::new(1), sink);
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("error event");
        assert!(matches!(
            event.kind,
            TransportEventKind::Error(TransportError::Connect { .. })
        ));
        transport.close();
    }
}
