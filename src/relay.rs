//! Event relay: the caller-facing duplex event surface.
//!
//! `IoService` presents one ordered event channel that is insulated from
//! socket churn: outbound events are serialized into a FIFO buffer and
//! drained whenever the connection is open, inbound frames are decoded and
//! fanned out to all current subscribers, and a `Snapshot` mirrors the
//! latest state and event for diagnostics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};

use crate::config::IoConfig;
use crate::conn::{ConnectionController, IoError};
use crate::proto::{IoEvent, IoEventName};
use crate::socket::{Connector, WsConnector};
use crate::state::ConnectionState;

/// Duplex event session over one relay connection.
#[derive(Debug)]
pub struct IoService {
    cfg: IoConfig,
    ctrl: ConnectionController,
    buffer: Arc<Mutex<VecDeque<String>>>,
    nudge: Arc<Notify>,
    events_tx: broadcast::Sender<IoEvent>,
    last_event: Arc<RwLock<Option<IoEvent>>>,
    active: AtomicBool,
    _relay_guard: oneshot::Sender<()>,
}

impl IoService {
    /// Creates a session over the production websocket transport.
    pub fn new(config: IoConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Creates a session over an injected socket transport.
    pub fn with_connector(config: IoConfig, connector: Arc<dyn Connector>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ctrl = ConnectionController::spawn(config.clone(), connector, inbound_tx);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let nudge = Arc::new(Notify::new());
        let last_event = Arc::new(RwLock::new(None));
        let (guard_tx, guard_rx) = oneshot::channel();

        let worker = RelayWorker {
            ctrl: ctrl.clone(),
            state_rx: ctrl.state(),
            inbound_rx,
            buffer: Arc::clone(&buffer),
            nudge: Arc::clone(&nudge),
            events_tx: events_tx.clone(),
            last_event: Arc::clone(&last_event),
            stop_rx: guard_rx,
        };
        tokio::spawn(worker.run());

        Self {
            cfg: config,
            ctrl,
            buffer,
            nudge,
            events_tx,
            last_event,
            active: AtomicBool::new(false),
            _relay_guard: guard_tx,
        }
    }

    /// Replaces the opaque session credential. Takes effect on the next
    /// (re)connect; pair with [`IoService::restart`] to apply immediately.
    pub fn set_credential(&self, token: SecretString) {
        self.ctrl.set_credential(token);
    }

    /// Brings the session up; resolves once the connection is open.
    pub async fn start(&self) -> Result<(), IoError> {
        self.ctrl.start().await?;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Takes the session down; resolves once the connection has settled
    /// closed. Buffered outbound events are kept for a later start.
    pub async fn stop(&self) -> Result<(), IoError> {
        self.active.store(false, Ordering::Release);
        self.ctrl.stop().await
    }

    /// Stop strictly followed by start. A stopped-while-off report from the
    /// stop half is tolerated; any other failure aborts the restart.
    pub async fn restart(&self) -> Result<(), IoError> {
        self.active.store(false, Ordering::Release);
        match self.ctrl.stop().await {
            Ok(()) | Err(IoError::NotStarted) => {}
            Err(err) => return Err(err),
        }
        self.ctrl.start().await?;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Enqueues an event for transmission. Never blocks: while the connection
    /// is not open the event is buffered and drained on the next OPEN
    /// transition, in enqueue order.
    pub fn send(&self, event: &IoEvent) -> Result<(), IoError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(IoError::NotStarted);
        }
        let text = event.to_text()?;
        {
            let mut buffer = lock(&self.buffer);
            if let Some(limit) = self.cfg.buffer_limit {
                if buffer.len() >= limit {
                    return Err(IoError::BufferOverflow(limit));
                }
            }
            buffer.push_back(text);
        }
        self.record(event);
        self.nudge.notify_one();
        Ok(())
    }

    /// Sends a `ding` liveness event.
    pub fn ding(&self, payload: impl Into<Value>) -> Result<(), IoError> {
        self.send(&IoEvent::new(IoEventName::Ding, payload))
    }

    /// Asks the remote peer to reset itself.
    pub fn reset(&self, reason: impl Into<Value>) -> Result<(), IoError> {
        self.send(&IoEvent::new(IoEventName::Reset, reason))
    }

    /// Asks the remote peer to shut down.
    pub fn shutdown(&self, reason: impl Into<Value>) -> Result<(), IoError> {
        self.send(&IoEvent::new(IoEventName::Shutdown, reason))
    }

    /// Asks the remote peer to log out.
    pub fn logout(&self, reason: impl Into<Value>) -> Result<(), IoError> {
        self.send(&IoEvent::new(IoEventName::Logout, reason))
    }

    /// Subscribes to the live inbound event sequence. Every subscriber
    /// receives every event from the point of subscription onward; there is
    /// no historical replay.
    pub fn subscribe(&self) -> broadcast::Receiver<IoEvent> {
        self.events_tx.subscribe()
    }

    /// Latest-value-replay Connection State signal.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctrl.state()
    }

    pub fn is_online(&self) -> bool {
        self.ctrl.is_online()
    }

    pub fn is_connecting(&self) -> bool {
        self.ctrl.is_connecting()
    }

    /// Read-only mirror of the current state and most recent event.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state_rx: self.ctrl.state(),
            last_event: Arc::clone(&self.last_event),
        }
    }

    fn record(&self, event: &IoEvent) {
        *self
            .last_event
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
    }
}

/// Diagnostic mirror of `{connection state, most recent event}`.
///
/// Purely observational; nothing reads it to drive behavior.
#[derive(Clone, Debug)]
pub struct Snapshot {
    state_rx: watch::Receiver<ConnectionState>,
    last_event: Arc<RwLock<Option<IoEvent>>>,
}

impl Snapshot {
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn last_event(&self) -> Option<IoEvent> {
        self.last_event
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct RelayWorker {
    ctrl: ConnectionController,
    state_rx: watch::Receiver<ConnectionState>,
    inbound_rx: mpsc::UnboundedReceiver<String>,
    buffer: Arc<Mutex<VecDeque<String>>>,
    nudge: Arc<Notify>,
    events_tx: broadcast::Sender<IoEvent>,
    last_event: Arc<RwLock<Option<IoEvent>>>,
    stop_rx: oneshot::Receiver<()>,
}

impl RelayWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.state_rx.borrow_and_update().is_open() {
                        self.drain().await;
                    }
                }
                maybe_frame = self.inbound_rx.recv() => {
                    match maybe_frame {
                        Some(text) => self.publish(IoEvent::from_frame(&text)),
                        None => break,
                    }
                }
                _ = self.nudge.notified() => {
                    if self.ctrl.is_online() {
                        self.drain().await;
                    }
                }
                _ = &mut self.stop_rx => break,
            }
        }
    }

    /// Transmits buffered frames front-first until the buffer is observed
    /// empty, so nothing enqueued mid-drain is stranded. A transport failure
    /// re-queues the frame at the front for the next OPEN transition.
    async fn drain(&mut self) {
        loop {
            let next = lock(&self.buffer).pop_front();
            let Some(text) = next else { return };
            if let Err(err) = self.ctrl.transmit(text.clone()).await {
                tracing::debug!(error = %err, "drain paused; frame re-queued");
                lock(&self.buffer).push_front(text);
                return;
            }
        }
    }

    fn publish(&self, event: IoEvent) {
        tracing::trace!(name = %event.name, "inbound event");
        *self
            .last_event
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
        let _ = self.events_tx.send(event);
    }
}

fn lock(buffer: &Mutex<VecDeque<String>>) -> MutexGuard<'_, VecDeque<String>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
