//! Connection worker thread shared by the transports.
//!
//! Delivery goes through a gate. `ConnectionWorker::shutdown` closes the gate
//! under its lock before joining, so once it returns no further event for that
//! connection can reach the sink.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{EventSink, Generation, TransportEvent, TransportEventKind};

#[derive(Clone, Debug)]
struct Gate {
    open: Arc<Mutex<bool>>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    fn close(&self) {
        *self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle held by the worker thread.
pub(crate) struct ConnectionTask {
    generation: Generation,
    sink: EventSink,
    gate: Gate,
    stop_rx: mpsc::Receiver<()>,
}

impl ConnectionTask {
    /// Deliver an event unless the connection has been closed.
    pub(crate) fn emit(&self, kind: TransportEventKind) -> bool {
        let open = self.gate.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*open {
            return false;
        }
        self.sink
            .send(TransportEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub(crate) fn should_stop(&self) -> bool {
        if !self.gate.is_open() {
            return true;
        }
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for `interval`, waking early on close. Returns true when asked to stop.
    pub(crate) fn wait(&self, interval: Duration) -> bool {
        match self.stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => !self.gate.is_open(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Owner side of a connection worker.
pub(crate) struct ConnectionWorker {
    generation: Generation,
    gate: Gate,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWorker {
    pub(crate) fn spawn<F>(
        thread_name: &str,
        generation: Generation,
        sink: EventSink,
        body: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce(ConnectionTask) + Send + 'static,
    {
        let gate = Gate::new();
        let (stop_tx, stop_rx) = mpsc::channel();
        let task = ConnectionTask {
            generation,
            sink,
            gate: gate.clone(),
            stop_rx,
        };
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", thread_name, generation.get()))
            .spawn(move || body(task))?;
        Ok(Self {
            generation,
            gate,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Close the gate, signal the thread, and join it.
    pub(crate) fn shutdown(&mut self) {
        self.gate.close();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("connection worker {} panicked", self.generation);
            }
        }
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
