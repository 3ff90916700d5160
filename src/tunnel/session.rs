//! Tunnel Session
//!
//! Drives one tunnel through its lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Established
//!              \              \
//!               +--------------+--> Failed(reason)
//! any -> Stopped
//! ```
//!
//! All state lives on a single actor task. Commands from the handle and
//! events from the socket, reader and timer tasks are processed there one
//! at a time, so the authentication timer and the server's response can
//! never both decide the outcome of a start. Every socket attempt gets a
//! fresh id; events tagged with an older id are discarded.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::flow::{
    Connector, DatagramSocket, NetworkSettingsApplier, PacketFlow, TunnelNetworkSettings,
};
use super::relay::{self, InboundQueue, RelayStats, RelayStatsSnapshot};
use crate::config::{TunnelConfiguration, WolfLinkConfig};
use crate::crypto::{Cipher, SymmetricKey};
use crate::error::{Error, FailureReason, Result};
use crate::protocol::{self, ClientAuthRequest, PacketCode, ServerAuthResponse};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet
    Idle,
    /// Opening the datagram socket
    Connecting,
    /// Auth request sent, waiting for the server's verdict
    Authenticating,
    /// Relaying packets
    Established,
    /// The last start attempt failed
    Failed(FailureReason),
    /// Torn down by `stop`
    Stopped,
}

impl SessionState {
    /// A start is in flight and its completion has not fired yet
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Authenticating)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Authenticating => f.write_str("authenticating"),
            SessionState::Established => f.write_str("established"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            SessionState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Inbound batches buffered ahead of the interface writer
const INBOUND_QUEUE: usize = 64;

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long to wait for the server's authentication response
    pub auth_timeout: Duration,
    /// Upper bound on applying network settings; a `stop` issued meanwhile
    /// waits at most this long
    pub settings_timeout: Duration,
    /// Local interface address passed along with the network settings
    pub local_address: Option<String>,
    pub mtu: Option<u16>,
    pub routes: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            settings_timeout: Duration::from_secs(10),
            local_address: None,
            mtu: None,
            routes: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &WolfLinkConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout(),
            settings_timeout: Duration::from_secs(10),
            local_address: config.interface.address.clone(),
            mtu: Some(config.interface.mtu),
            routes: config.interface.routes.clone(),
        }
    }

    fn network_settings(&self, remote_address: String) -> TunnelNetworkSettings {
        TunnelNetworkSettings {
            remote_address,
            local_address: self.local_address.clone(),
            mtu: self.mtu,
            routes: self.routes.clone(),
        }
    }
}

/// Host capabilities a session drives
#[derive(Clone)]
pub struct SessionIo {
    pub connector: Arc<dyn Connector>,
    pub flow: Arc<dyn PacketFlow>,
    pub settings: Arc<dyn NetworkSettingsApplier>,
}

/// Requests from the session handle
enum Command {
    Start {
        config: TunnelConfiguration,
        done: oneshot::Sender<Result<()>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    AppMessage {
        data: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

type AttemptId = u64;

/// Notifications from tasks spawned for one attempt
enum Event {
    SocketReady {
        attempt: AttemptId,
        socket: Arc<dyn DatagramSocket>,
    },
    SocketFailed {
        attempt: AttemptId,
        error: io::Error,
    },
    Datagrams {
        attempt: AttemptId,
        datagrams: Vec<Vec<u8>>,
    },
    ReceiveFailed {
        attempt: AttemptId,
        error: io::Error,
    },
    TimedOut {
        attempt: AttemptId,
    },
    RelayFailed {
        attempt: AttemptId,
        error: io::Error,
    },
}

impl Event {
    fn attempt(&self) -> AttemptId {
        match self {
            Event::SocketReady { attempt, .. }
            | Event::SocketFailed { attempt, .. }
            | Event::Datagrams { attempt, .. }
            | Event::ReceiveFailed { attempt, .. }
            | Event::TimedOut { attempt }
            | Event::RelayFailed { attempt, .. } => *attempt,
        }
    }
}

/// Handle to a tunnel session
///
/// Cloning the handle shares the session. The actor task exits and tears
/// the tunnel down when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    stats: Arc<RelayStats>,
}

impl Session {
    /// Create a session and spawn its actor on the current runtime
    pub fn new(key: &SymmetricKey, io: SessionIo, options: SessionOptions) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let stats = Arc::new(RelayStats::default());

        let actor = SessionActor {
            cipher: Cipher::new(key),
            io,
            options,
            state: state_tx,
            stats: stats.clone(),
            events: event_tx,
            next_attempt: 0,
            attempt: None,
        };
        tokio::spawn(actor.run(command_rx, event_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            stats,
        }
    }

    /// Connect and authenticate; resolves once with the outcome
    pub async fn start(&self, config: TunnelConfiguration) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(Command::Start { config, done })
            .await
            .map_err(|_| Error::Internal("session task has exited".into()))?;
        // A dropped sender means the session went away mid-start.
        outcome.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Tear the tunnel down; a second call is a no-op
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).await.is_ok() {
            let _ = stopped.await;
        }
    }

    /// Exchange a message with the running session (currently an echo)
    pub async fn handle_app_message(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::AppMessage { data, reply })
            .await
            .map_err(|_| Error::Internal("session task has exited".into()))?;
        response.await.map_err(|_| Error::Cancelled)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions in order
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Everything owned by one start attempt
struct Attempt {
    id: AttemptId,
    config: TunnelConfiguration,
    socket: Option<Arc<dyn DatagramSocket>>,
    /// Stops every task spawned for this attempt
    cancel: CancellationToken,
    /// Stops only the authentication timer
    timer: CancellationToken,
    completion: Option<oneshot::Sender<Result<()>>>,
    /// Feeds the interface writer once established
    inbound: Option<InboundQueue>,
}

impl Attempt {
    /// Fire the start completion; later calls find the slot empty
    fn complete(&mut self, outcome: Result<()>) {
        if let Some(done) = self.completion.take() {
            let _ = done.send(outcome);
        }
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.socket = None;
        self.inbound = None;
    }
}

struct SessionActor {
    cipher: Cipher,
    io: SessionIo,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    stats: Arc<RelayStats>,
    events: mpsc::Sender<Event>,
    next_attempt: AttemptId,
    attempt: Option<Attempt>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        debug!("Session handle dropped, shutting down");
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.close();
            attempt.complete(Err(Error::Cancelled));
        }
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, done } => self.start(config, done),
            Command::Stop { done } => {
                self.stop();
                let _ = done.send(());
            }
            Command::AppMessage { data, reply } => {
                debug!("App message ({} bytes)", data.len());
                let _ = reply.send(data);
            }
        }
    }

    fn start(&mut self, config: TunnelConfiguration, done: oneshot::Sender<Result<()>>) {
        let state = self.current();
        if state.is_pending() || state == SessionState::Established {
            warn!("Start requested while session is {}", state);
            let _ = done.send(Err(Error::AlreadyStarted));
            return;
        }

        self.next_attempt += 1;
        let id = self.next_attempt;
        let cancel = CancellationToken::new();
        let timer = cancel.child_token();

        info!("Connecting to {} as {}", config.server_address(), config.username);
        self.stats.reset();
        self.set_state(SessionState::Connecting);

        // Open the socket
        let connector = self.io.connector.clone();
        let events = self.events.clone();
        let (hostname, port) = (config.hostname.clone(), config.port.clone());
        let opening = cancel.clone();
        tokio::spawn(async move {
            let event = tokio::select! {
                _ = opening.cancelled() => return,
                result = connector.open(&hostname, &port) => match result {
                    Ok(socket) => Event::SocketReady { attempt: id, socket },
                    Err(error) => Event::SocketFailed { attempt: id, error },
                },
            };
            let _ = events.send(event).await;
        });

        // Arm the authentication timeout
        let events = self.events.clone();
        let timeout = self.options.auth_timeout;
        let armed = timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(Event::TimedOut { attempt: id }).await;
                }
            }
        });

        self.attempt = Some(Attempt {
            id,
            config,
            socket: None,
            cancel,
            timer,
            completion: Some(done),
            inbound: None,
        });
    }

    fn stop(&mut self) {
        if self.current() == SessionState::Stopped {
            debug!("Stop requested on a stopped session");
            return;
        }

        info!("Stopping tunnel");
        self.set_state(SessionState::Stopped);
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.close();
            attempt.complete(Err(Error::Cancelled));
        }
    }

    /// End a pending start with `error`
    fn fail(&mut self, error: Error) {
        let reason = error.failure_reason().unwrap_or(FailureReason::ConnectionFailed);
        error!("Tunnel start failed: {}", error);
        self.set_state(SessionState::Failed(reason));
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.close();
            attempt.complete(Err(error));
        }
    }

    async fn handle_event(&mut self, event: Event) {
        let current = self.attempt.as_ref().map(|a| a.id);
        if current != Some(event.attempt()) {
            debug!("Discarding event from superseded attempt {}", event.attempt());
            return;
        }

        let state = self.current();
        match event {
            Event::SocketReady { socket, .. } => {
                if state == SessionState::Connecting {
                    self.on_socket_ready(socket).await;
                }
            }
            Event::SocketFailed { error, .. } => {
                if state.is_pending() {
                    let address = self.server_address();
                    self.fail(Error::ConnectionFailed {
                        address,
                        reason: error.to_string(),
                    });
                }
            }
            Event::Datagrams { datagrams, .. } => match state {
                SessionState::Authenticating => self.on_auth_datagrams(datagrams).await,
                SessionState::Established => self.queue_inbound(datagrams),
                _ => {}
            },
            Event::ReceiveFailed { error, .. } => {
                if state.is_pending() {
                    let address = self.server_address();
                    self.fail(Error::ConnectionFailed {
                        address,
                        reason: error.to_string(),
                    });
                } else if state == SessionState::Established {
                    self.lose(&error);
                }
            }
            Event::RelayFailed { error, .. } => {
                if state == SessionState::Established {
                    self.lose(&error);
                }
            }
            Event::TimedOut { .. } => {
                if state.is_pending() {
                    self.fail(Error::Timeout(self.options.auth_timeout));
                }
            }
        }
    }

    /// Tear down an established tunnel that can no longer relay
    fn lose(&mut self, error: &io::Error) {
        error!("Tunnel to {} lost: {}", self.server_address(), error);
        self.set_state(SessionState::Failed(FailureReason::ConnectionFailed));
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.close();
        }
    }

    fn queue_inbound(&self, datagrams: Vec<Vec<u8>>) {
        if let Some(queue) = self.attempt.as_ref().and_then(|a| a.inbound.as_ref()) {
            relay::queue_inbound(datagrams, &self.cipher, queue, &self.stats);
        }
    }

    fn server_address(&self) -> String {
        self.attempt
            .as_ref()
            .map(|a| a.config.server_address())
            .unwrap_or_default()
    }

    async fn on_socket_ready(&mut self, socket: Arc<dyn DatagramSocket>) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        debug!("Socket to {} is ready", socket.peer());
        attempt.socket = Some(socket.clone());
        let request = ClientAuthRequest {
            login: attempt.config.username.clone(),
            password: attempt.config.password.clone(),
        };
        spawn_reader(attempt.id, socket.clone(), self.events.clone(), attempt.cancel.clone());
        self.set_state(SessionState::Authenticating);

        let sent = match protocol::encode(&request, &self.cipher) {
            Ok(datagram) => socket.send_datagrams(&[datagram]).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => info!("Authentication request sent to {}", socket.peer()),
            Err(e) => {
                let address = self.server_address();
                self.fail(Error::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn on_auth_datagrams(&mut self, datagrams: Vec<Vec<u8>>) {
        let mut datagrams = datagrams.into_iter();
        while let Some(datagram) = datagrams.next() {
            match PacketCode::from_datagram(&datagram) {
                Ok(PacketCode::ServerAuthResponse) => {}
                Ok(code) => {
                    debug!("Ignoring {} datagram while authenticating", code.type_name());
                    continue;
                }
                Err(e) => {
                    debug!("Dropping datagram while authenticating: {}", e);
                    continue;
                }
            }

            let response: ServerAuthResponse = match protocol::decode(&datagram, &self.cipher) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Dropping undecodable authentication response: {}", e);
                    continue;
                }
            };

            if !response.is_ok {
                self.fail(Error::AuthenticationRejected);
                return;
            }

            self.establish(response.address).await;

            let rest: Vec<Vec<u8>> = datagrams.collect();
            if !rest.is_empty() && self.current() == SessionState::Established {
                self.queue_inbound(rest);
            }
            return;
        }
    }

    async fn establish(&mut self, remote_address: String) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        // The timer must be dead before the outcome is decided.
        attempt.timer.cancel();

        info!("Authenticated, tunnel remote address {}", remote_address);
        let settings = self.options.network_settings(remote_address);
        let limit = self.options.settings_timeout;
        let applied = match tokio::time::timeout(limit, self.io.settings.apply(&settings)).await {
            Ok(result) => result,
            Err(_) => Err(Error::NetworkSettings(format!(
                "not applied within {:?}",
                limit
            ))),
        };
        if let Err(e) = applied {
            let error = match e {
                Error::NetworkSettings(_) => e,
                other => Error::NetworkSettings(other.to_string()),
            };
            self.fail(error);
            return;
        }

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let Some(socket) = attempt.socket.clone() else {
            return;
        };

        let (queue, pending) = mpsc::channel(INBOUND_QUEUE);
        attempt.inbound = Some(queue);
        tokio::spawn(relay::run_inbound_writer(
            self.io.flow.clone(),
            pending,
            attempt.cancel.child_token(),
        ));

        let outbound = relay::run_outbound(
            self.io.flow.clone(),
            socket,
            self.cipher.clone(),
            self.stats.clone(),
            attempt.cancel.child_token(),
        );
        let events = self.events.clone();
        let id = attempt.id;
        tokio::spawn(async move {
            if let Err(error) = outbound.await {
                let _ = events.send(Event::RelayFailed { attempt: id, error }).await;
            }
        });
        self.set_state(SessionState::Established);
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.complete(Ok(()));
        }
        info!("Tunnel established");
    }
}

/// Forward received batches to the actor until the attempt is cancelled
fn spawn_reader(
    attempt: AttemptId,
    socket: Arc<dyn DatagramSocket>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_datagrams() => match result {
                    Ok(datagrams) => Event::Datagrams { attempt, datagrams },
                    Err(e) if is_transient(&e) => {
                        debug!("Transient receive error from {}: {}", socket.peer(), e);
                        continue;
                    }
                    Err(error) => {
                        let _ = events.send(Event::ReceiveFailed { attempt, error }).await;
                        break;
                    }
                },
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    });
}

/// Receive errors a connected UDP socket reports for ICMP noise
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
