//! Connection controller: single-socket ownership and lifecycle recovery.
//!
//! The controller spawns a background worker that owns the physical socket
//! and is the only place Connection State is mutated. Callers interact
//! through a cloneable handle; `start`/`stop` return pending results that
//! settle when the underlying socket operation is observed complete, and the
//! worker schedules a fixed-delay reopen after unexpected closes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::config::IoConfig;
use crate::socket::{Connector, Socket, SocketClose, SocketError, SocketSignal};
use crate::state::{ConnectionState, Lifecycle, Target};

/// Errors reported by the session surface.
#[derive(Debug, Error)]
pub enum IoError {
    /// A socket is already held; at most one may exist per controller.
    #[error("a socket is already held")]
    AlreadyConnected,

    /// No live socket to act on.
    #[error("no live connection")]
    NoConnection,

    /// The lifecycle switch does not permit the requested transition.
    #[error("invalid lifecycle state: {0}")]
    InvalidLifecycleState(Lifecycle),

    /// The open handshake did not complete within the configured window.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// `start` was called before a credential was set.
    #[error("session credential is not set")]
    MissingCredential,

    /// The session has not been started (or has been stopped).
    #[error("session is not started")]
    NotStarted,

    /// A pending operation was abandoned by a concurrent `stop`.
    #[error("canceled by stop")]
    Canceled,

    /// The outbound buffer reached its configured cap.
    #[error("outbound buffer is full (limit {0})")]
    BufferOverflow(usize),

    /// Transport failure from the physical socket.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Event could not be encoded as wire text.
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The background worker has exited.
    #[error("session worker is gone")]
    WorkerGone,
}

enum Command {
    SetCredential(SecretString),
    Start {
        reply: oneshot::Sender<Result<(), IoError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), IoError>>,
    },
    Transmit {
        text: String,
        reply: oneshot::Sender<Result<(), IoError>>,
    },
}

/// Handle to the socket-owning worker.
#[derive(Clone, Debug)]
pub struct ConnectionController {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionController {
    /// Spawns the worker. Raw inbound frames are forwarded to `inbound`.
    pub fn spawn(
        config: IoConfig,
        connector: Arc<dyn Connector>,
        inbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let worker = Worker::new(config, connector, cmd_rx, state_tx, inbound);
        tokio::spawn(worker.run());
        Self { cmd_tx, state_rx }
    }

    /// Replaces the session credential; applies on the next (re)connect.
    pub fn set_credential(&self, token: SecretString) {
        let _ = self.cmd_tx.send(Command::SetCredential(token));
    }

    /// Brings the session up. Resolves once the open handshake completes, or
    /// fails without retry when it errors or times out.
    pub async fn start(&self) -> Result<(), IoError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Takes the session down. Resolves once Connection State has settled to
    /// CLOSED; reports `NotStarted` when the switch is already off.
    pub async fn stop(&self) -> Result<(), IoError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Writes one frame over the live socket.
    pub async fn transmit(&self, text: String) -> Result<(), IoError> {
        self.request(|reply| Command::Transmit { text, reply }).await
    }

    /// Latest-value-replay Connection State signal.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_online(&self) -> bool {
        self.state_rx.borrow().is_open()
    }

    pub fn is_connecting(&self) -> bool {
        self.state_rx.borrow().is_connecting()
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), IoError>>) -> Command,
    ) -> Result<(), IoError> {
        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .map_err(|_| IoError::WorkerGone)?;
        outcome.await.map_err(|_| IoError::WorkerGone)?
    }
}

type ConnectAttempt =
    BoxFuture<'static, Result<Result<Box<dyn Socket>, SocketError>, time::error::Elapsed>>;

struct Worker {
    cfg: IoConfig,
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<String>,
    credential: Option<SecretString>,
    lifecycle: Lifecycle,
    auto_reconnect: bool,
    socket: Option<Box<dyn Socket>>,
    connecting: Option<ConnectAttempt>,
    start_reply: Option<oneshot::Sender<Result<(), IoError>>>,
    stop_reply: Option<oneshot::Sender<Result<(), IoError>>>,
    reconnect_at: Option<Instant>,
    close_deadline: Option<Instant>,
}

impl Worker {
    fn new(
        cfg: IoConfig,
        connector: Arc<dyn Connector>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            cfg,
            connector,
            cmd_rx,
            state_tx,
            inbound_tx,
            credential: None,
            lifecycle: Lifecycle::Off,
            auto_reconnect: false,
            socket: None,
            connecting: None,
            start_reply: None,
            stop_reply: None,
            reconnect_at: None,
            close_deadline: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                outcome = next_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.settle_connect(outcome);
                }
                signal = next_signal(&mut self.socket) => {
                    self.handle_signal(signal);
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reopen();
                }
                _ = wait_until(self.close_deadline) => {
                    self.close_deadline = None;
                    self.force_closed();
                }
            }
        }

        // Handle dropped: leave nothing half-open behind.
        if self.socket.is_some() {
            let _ = self.close_socket(1000, "session dropped").await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetCredential(token) => {
                tracing::debug!("session credential replaced");
                self.credential = Some(token);
            }
            Command::Start { reply } => self.handle_start(reply),
            Command::Stop { reply } => self.handle_stop(reply).await,
            Command::Transmit { text, reply } => self.handle_transmit(text, reply).await,
        }
    }

    fn handle_start(&mut self, reply: oneshot::Sender<Result<(), IoError>>) {
        if !self.lifecycle.can_start() {
            let _ = reply.send(Err(IoError::InvalidLifecycleState(self.lifecycle)));
            return;
        }
        if self.credential.is_none() {
            let _ = reply.send(Err(IoError::MissingCredential));
            return;
        }
        self.auto_reconnect = self.cfg.reconnect;
        self.lifecycle = Lifecycle::Pending(Target::On);
        match self.open_socket() {
            Ok(()) => self.start_reply = Some(reply),
            Err(err) => {
                self.lifecycle = Lifecycle::Off;
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn handle_stop(&mut self, reply: oneshot::Sender<Result<(), IoError>>) {
        if !self.lifecycle.can_stop() {
            let _ = reply.send(Err(IoError::NotStarted));
            return;
        }
        self.auto_reconnect = false;
        self.reconnect_at = None;

        if self.connecting.take().is_some() {
            // Abandon the pending open outright.
            if let Some(start) = self.start_reply.take() {
                let _ = start.send(Err(IoError::Canceled));
            }
            self.lifecycle = Lifecycle::Off;
            self.set_state(ConnectionState::Closed);
            let _ = reply.send(Ok(()));
            return;
        }

        if self.socket.is_none() {
            // Nothing live, e.g. parked on the reconnect timer.
            self.lifecycle = Lifecycle::Off;
            self.set_state(ConnectionState::Closed);
            let _ = reply.send(Ok(()));
            return;
        }

        self.lifecycle = Lifecycle::Pending(Target::Off);
        let _ = self.close_socket(1000, "stop()").await;
        if self.socket.is_none() {
            // The close request itself failed and the socket was dropped.
            self.lifecycle = Lifecycle::Off;
            let _ = reply.send(Ok(()));
        } else {
            self.stop_reply = Some(reply);
            self.close_deadline = Some(Instant::now() + self.cfg.close_grace);
        }
    }

    async fn handle_transmit(&mut self, text: String, reply: oneshot::Sender<Result<(), IoError>>) {
        if *self.state_tx.borrow() != ConnectionState::Open {
            let _ = reply.send(Err(IoError::NoConnection));
            return;
        }
        let result = match self.socket.as_mut() {
            Some(socket) => socket.transmit(text).await.map_err(IoError::Socket),
            None => Err(IoError::NoConnection),
        };
        let _ = reply.send(result);
    }

    /// Initiates the open handshake. The switch must be pending-toward-on and
    /// no socket may be held.
    fn open_socket(&mut self) -> Result<(), IoError> {
        if self.socket.is_some() {
            return Err(IoError::AlreadyConnected);
        }
        if !self.lifecycle.opening() {
            return Err(IoError::InvalidLifecycleState(self.lifecycle));
        }
        let token = self
            .credential
            .as_ref()
            .ok_or(IoError::MissingCredential)?;
        let url = format!("{}{}", self.cfg.endpoint, token.expose_secret());
        let attempt = self.connector.connect(&url, &self.cfg.subprotocol);
        self.connecting = Some(Box::pin(time::timeout(self.cfg.connect_timeout, attempt)));
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Requests socket shutdown; the state settles to CLOSED only once the
    /// close signal is observed.
    async fn close_socket(&mut self, code: u16, reason: &str) -> Result<(), IoError> {
        if self.socket.is_none() {
            return Err(IoError::NoConnection);
        }
        self.set_state(ConnectionState::Closing);
        let shutdown = match self.socket.as_mut() {
            Some(socket) => socket.shutdown(code, reason.to_string()).await,
            None => Ok(()),
        };
        if let Err(err) = shutdown {
            tracing::warn!(error = %err, "close request failed; dropping socket");
            self.socket = None;
            self.set_state(ConnectionState::Closed);
        }
        Ok(())
    }

    fn settle_connect(&mut self, outcome: Result<Result<Box<dyn Socket>, SocketError>, time::error::Elapsed>) {
        match outcome {
            Ok(Ok(socket)) => {
                self.socket = Some(socket);
                self.lifecycle = Lifecycle::On;
                self.set_state(ConnectionState::Open);
                tracing::debug!("socket open");
                if let Some(reply) = self.start_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Ok(Err(err)) => self.fail_connect(IoError::Socket(err)),
            Err(_) => self.fail_connect(IoError::ConnectTimeout(self.cfg.connect_timeout)),
        }
    }

    fn fail_connect(&mut self, err: IoError) {
        self.set_state(ConnectionState::Closed);
        if self.auto_reconnect && self.cfg.reconnect_on_connect_failure {
            self.lifecycle = Lifecycle::Pending(Target::On);
            self.reconnect_at = Some(Instant::now() + self.cfg.reconnect_delay);
        } else {
            self.lifecycle = Lifecycle::Off;
        }
        match self.start_reply.take() {
            Some(reply) => {
                let _ = reply.send(Err(err));
            }
            None => tracing::warn!(error = %err, "reconnect attempt failed"),
        }
    }

    fn handle_signal(&mut self, signal: SocketSignal) {
        match signal {
            SocketSignal::Frame(text) => {
                let _ = self.inbound_tx.send(text);
            }
            SocketSignal::Error(message) => {
                // A close signal is expected to follow; no transition here.
                tracing::warn!(%message, "socket error");
            }
            SocketSignal::Closed(close) => self.handle_closed(close),
        }
    }

    fn handle_closed(&mut self, close: SocketClose) {
        self.socket = None;
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed);

        if let Some(reply) = self.stop_reply.take() {
            self.lifecycle = Lifecycle::Off;
            let _ = reply.send(Ok(()));
            return;
        }

        if !close.clean {
            tracing::warn!(code = close.code, "socket closed uncleanly");
        }
        if self.auto_reconnect {
            self.lifecycle = Lifecycle::Pending(Target::On);
            self.reconnect_at = Some(Instant::now() + self.cfg.reconnect_delay);
            tracing::debug!(delay_ms = self.cfg.reconnect_delay.as_millis() as u64, "reopen scheduled");
        } else {
            self.lifecycle = Lifecycle::Off;
        }
    }

    fn reopen(&mut self) {
        if let Err(err) = self.open_socket() {
            tracing::warn!(error = %err, "reopen attempt failed");
            self.lifecycle = Lifecycle::Off;
            self.set_state(ConnectionState::Closed);
        }
    }

    fn force_closed(&mut self) {
        tracing::warn!("close not acknowledged within grace period; forcing CLOSED");
        self.socket = None;
        self.lifecycle = Lifecycle::Off;
        self.set_state(ConnectionState::Closed);
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if *self.state_tx.borrow() != next {
            tracing::debug!(state = %next, "connection state");
            self.state_tx.send_replace(next);
        }
    }
}

async fn next_connect(
    slot: &mut Option<ConnectAttempt>,
) -> Result<Result<Box<dyn Socket>, SocketError>, time::error::Elapsed> {
    match slot.as_mut() {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn next_signal(socket: &mut Option<Box<dyn Socket>>) -> SocketSignal {
    match socket.as_mut() {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock::{Handshake, MockConnector};

    fn test_config() -> IoConfig {
        IoConfig::default().with_endpoint("ws://relay.test/v0/websocket/token/")
    }

    fn spawn_controller() -> (
        ConnectionController,
        mpsc::UnboundedReceiver<Handshake>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (connector, handshakes) = MockConnector::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ctrl = ConnectionController::spawn(test_config(), connector, inbound_tx);
        (ctrl, handshakes, inbound_rx)
    }

    fn credential(token: &str) -> SecretString {
        SecretString::new(token.to_string())
    }

    async fn started(
        ctrl: &ConnectionController,
        handshakes: &mut mpsc::UnboundedReceiver<Handshake>,
    ) -> crate::socket::mock::Remote {
        let pending = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.start().await }
        });
        let handshake = handshakes.recv().await.expect("connect attempt");
        let remote = handshake.accept();
        pending.await.expect("join").expect("start");
        remote
    }

    #[tokio::test(start_paused = true)]
    async fn start_connects_with_credential_and_subprotocol() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let pending = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.start().await }
        });
        let handshake = handshakes.recv().await.expect("connect attempt");
        assert_eq!(handshake.url, "ws://relay.test/v0/websocket/token/tok-123");
        assert!(handshake.subprotocol.starts_with("web|"));
        let _remote = handshake.accept();
        pending.await.expect("join").expect("start");
        assert!(ctrl.is_online());
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_credential_is_rejected() {
        let (ctrl, _handshakes, _inbound) = spawn_controller();
        let err = ctrl.start().await.expect_err("no credential");
        assert!(matches!(err, IoError::MissingCredential));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_on() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let _remote = started(&ctrl, &mut handshakes).await;
        let err = ctrl.start().await.expect_err("double start");
        assert!(matches!(err, IoError::InvalidLifecycleState(Lifecycle::On)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_fails_start_and_settles_off() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let pending = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.start().await }
        });
        // Hold the handshake so the attempt stays pending past the timeout.
        let handshake = handshakes.recv().await.expect("connect attempt");
        let err = pending.await.expect("join").expect_err("timeout");
        assert!(matches!(err, IoError::ConnectTimeout(_)));
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
        let err = ctrl.stop().await.expect_err("switch is off");
        assert!(matches!(err, IoError::NotStarted));
        drop(handshake);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_off_reports_not_started_without_state_change() {
        let (ctrl, _handshakes, _inbound) = spawn_controller();
        let err = ctrl.stop().await.expect_err("already off");
        assert!(matches!(err, IoError::NotStarted));
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_with_normal_code_and_disables_reconnect() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let mut remote = started(&ctrl, &mut handshakes).await;
        ctrl.stop().await.expect("stop");
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
        let (code, reason) = remote.close_rx.recv().await.expect("close request");
        assert_eq!(code, 1000);
        assert_eq!(reason, "stop()");
        // A requested stop never schedules a reopen.
        time::sleep(Duration::from_secs(3)).await;
        assert!(handshakes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unclean_close_schedules_fixed_delay_reopen() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let remote = started(&ctrl, &mut handshakes).await;
        let closed_at = Instant::now();
        remote.close(false, 1006);
        let handshake = handshakes.recv().await.expect("reopen attempt");
        assert!(Instant::now() - closed_at >= Duration::from_secs(1));
        let _remote = handshake.accept();
        time::sleep(Duration::from_millis(10)).await;
        assert!(ctrl.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_settles_off() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let remote = started(&ctrl, &mut handshakes).await;
        remote.close(false, 1006);
        handshakes.recv().await.expect("reopen attempt").reject();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
        let err = ctrl.stop().await.expect_err("switch is off");
        assert!(matches!(err, IoError::NotStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pending_connect_cancels_the_attempt() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let pending = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.start().await }
        });
        let handshake = handshakes.recv().await.expect("connect attempt");
        ctrl.stop().await.expect("stop while pending");
        let err = pending.await.expect("join").expect_err("canceled");
        assert!(matches!(err, IoError::Canceled));
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
        drop(handshake);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_close_is_forced_after_grace() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let pending = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.start().await }
        });
        let remote = handshakes.recv().await.expect("connect attempt").accept_silent();
        pending.await.expect("join").expect("start");
        let stopped_at = Instant::now();
        ctrl.stop().await.expect("stop");
        assert!(Instant::now() - stopped_at >= Duration::from_secs(5));
        assert_eq!(*ctrl.state().borrow(), ConnectionState::Closed);
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_are_forwarded_in_order() {
        let (ctrl, mut handshakes, mut inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let remote = started(&ctrl, &mut handshakes).await;
        remote.frame("one");
        remote.frame("two");
        assert_eq!(inbound.recv().await.expect("frame"), "one");
        assert_eq!(inbound.recv().await.expect("frame"), "two");
    }

    #[tokio::test(start_paused = true)]
    async fn socket_error_alone_does_not_change_state() {
        let (ctrl, mut handshakes, _inbound) = spawn_controller();
        ctrl.set_credential(credential("tok-123"));
        let remote = started(&ctrl, &mut handshakes).await;
        remote.error("tls hiccup");
        time::sleep(Duration::from_millis(10)).await;
        assert!(ctrl.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn transmit_without_connection_is_rejected() {
        let (ctrl, _handshakes, _inbound) = spawn_controller();
        let err = ctrl.transmit("x".to_string()).await.expect_err("offline");
        assert!(matches!(err, IoError::NoConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_a_second_socket() {
        let (connector, mut handshakes) = MockConnector::new();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Closed);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut worker = Worker::new(
            test_config(),
            connector.clone(),
            cmd_rx,
            state_tx,
            inbound_tx,
        );
        worker.credential = Some(credential("tok-123"));
        worker.lifecycle = Lifecycle::Pending(Target::On);

        let attempt = connector.connect("ws://relay.test/v0/websocket/token/tok-123", "web|test");
        let _remote = handshakes.recv().await.expect("connect attempt").accept();
        worker.socket = Some(attempt.await.expect("socket"));

        assert!(matches!(worker.open_socket(), Err(IoError::AlreadyConnected)));

        worker.socket = None;
        worker.lifecycle = Lifecycle::On;
        assert!(matches!(
            worker.open_socket(),
            Err(IoError::InvalidLifecycleState(Lifecycle::On))
        ));
    }
}
