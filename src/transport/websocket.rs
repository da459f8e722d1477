//! Push transport over a WebSocket (`ws://host/ws`).
//!
//! Each `open` spawns one worker thread that connects, performs the client
//! handshake, and then reads frames. Handshake and frame reads use a short
//! socket timeout so the worker notices `close` within `read_poll`. The TCP
//! connect itself cannot be interrupted: a `close` issued during it waits up
//! to `connect_timeout`.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tungstenite::{HandshakeError, Message, WebSocket};
use url::Url;

use super::worker::{ConnectionTask, ConnectionWorker};
use super::{
    ConnectionCell, ConnectionState, EventSink, Generation, OpenOutcome, Transport,
    TransportEventKind,
};
use crate::error::TransportError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct WsSettings {
    /// Upper bound for the TCP connect, and separately for the handshake.
    pub connect_timeout: Duration,
    /// Socket read timeout; the latency of noticing a local close once the
    /// TCP connection is up.
    pub read_poll: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_poll: DEFAULT_READ_POLL,
        }
    }
}

pub struct WsTransport {
    endpoint: String,
    settings: WsSettings,
    state: ConnectionCell,
    worker: Option<ConnectionWorker>,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, settings: WsSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            state: ConnectionCell::default(),
            worker: None,
        }
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn open(&mut self, generation: Generation, sink: EventSink) -> OpenOutcome {
        if self.state.get().is_active() {
            log::debug!(
                "websocket open({}) ignored: connection already {}",
                generation,
                self.state.get().as_str()
            );
            return OpenOutcome::AlreadyActive;
        }
        // A previous connection that ended on its own still owns a thread.
        if let Some(mut finished) = self.worker.take() {
            finished.shutdown();
        }

        self.state.set(ConnectionState::Connecting);
        let endpoint = self.endpoint.clone();
        let settings = self.settings.clone();
        let state = self.state.clone();
        let spawned = ConnectionWorker::spawn("ws-conn", generation, sink.clone(), move |task| {
            run_connection(&endpoint, &settings, &state, task)
        });
        match spawned {
            Ok(worker) => {
                log::info!("websocket {} connecting to {}", generation, self.endpoint);
                self.worker = Some(worker);
            }
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                let _ = sink.send(super::TransportEvent {
                    generation,
                    kind: TransportEventKind::Error(TransportError::Io(format!(
                        "spawn connection worker: {}",
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
        log::debug!("websocket {} closed", worker.generation());
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_connection(
    endpoint: &str,
    settings: &WsSettings,
    state: &ConnectionCell,
    task: ConnectionTask,
) {
    let mut socket = match connect(endpoint, settings, &task) {
        Ok(Some(socket)) => socket,
        Ok(None) => return,
        Err(e) => {
            state.set(ConnectionState::Disconnected);
            task.emit(TransportEventKind::Error(e));
            return;
        }
    };

    if task.should_stop() {
        let _ = socket.close(None);
        let _ = socket.flush();
        return;
    }
    state.set(ConnectionState::Connected);
    task.emit(TransportEventKind::Opened);

    loop {
        if task.should_stop() {
            let _ = socket.close(None);
            let _ = socket.flush();
            return;
        }
        match socket.read() {
            Ok(Message::Text(text)) => {
                task.emit(TransportEventKind::Message(text.into()));
            }
            Ok(Message::Binary(bytes)) => {
                task.emit(TransportEventKind::Message(bytes.into()));
            }
            Ok(Message::Close(frame)) => {
                let code = frame.map(|frame| u16::from(frame.code));
                // Sends the queued close reply.
                let _ = socket.flush();
                state.set(ConnectionState::Disconnected);
                task.emit(TransportEventKind::Closed(code));
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if is_read_timeout(&e) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                state.set(ConnectionState::Disconnected);
                task.emit(TransportEventKind::Closed(None));
                return;
            }
            Err(tungstenite::Error::Io(e)) => {
                state.set(ConnectionState::Disconnected);
                task.emit(TransportEventKind::Error(TransportError::Io(e.to_string())));
                return;
            }
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                task.emit(TransportEventKind::Error(TransportError::Protocol(
                    e.to_string(),
                )));
                return;
            }
        }
    }
}

/// `Ok(None)` when the connection was closed locally before the handshake finished.
fn connect(
    endpoint: &str,
    settings: &WsSettings,
    task: &ConnectionTask,
) -> Result<Option<WebSocket<TcpStream>>, TransportError> {
    let addr = resolve(endpoint)?;
    let stream = TcpStream::connect_timeout(&addr, settings.connect_timeout).map_err(|e| {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }
    })?;
    let io_error = |e: io::Error| TransportError::Io(e.to_string());
    stream
        .set_read_timeout(Some(settings.read_poll))
        .map_err(io_error)?;
    stream
        .set_write_timeout(Some(settings.connect_timeout))
        .map_err(io_error)?;
    stream.set_nodelay(true).map_err(io_error)?;

    let handshake_error = |reason: String| TransportError::Handshake {
        endpoint: endpoint.to_string(),
        reason,
    };
    let deadline = Instant::now() + settings.connect_timeout;
    let mut round = tungstenite::client(endpoint, stream);
    loop {
        match round {
            Ok((socket, _response)) => return Ok(Some(socket)),
            // A read timed out mid-handshake; resume unless closed or overdue.
            Err(HandshakeError::Interrupted(mid)) => {
                if task.should_stop() {
                    return Ok(None);
                }
                if Instant::now() >= deadline {
                    return Err(handshake_error(format!(
                        "no handshake response within {}ms",
                        settings.connect_timeout.as_millis()
                    )));
                }
                round = mid.handshake();
            }
            Err(HandshakeError::Failure(e)) => return Err(handshake_error(e.to_string())),
        }
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    let url = Url::parse(endpoint)
        .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    if url.scheme() != "ws" {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    let port = url.port_or_known_default().unwrap_or(80);
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: "no address resolved".to_string(),
        })
}

fn is_read_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
