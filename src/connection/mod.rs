//! Resilient connection: a TCP client that re-dials after unexpected closes.
//!
//! DESIGN
//! ======
//! One actor task owns all connection state. Callers talk to it through an
//! `mpsc` command channel and get `oneshot` acknowledgements back; events fan
//! out over `broadcast`, and the current [`ConnectionState`] is published
//! through `watch`. The transition logic lives in [`machine`] and is free of
//! I/O; the actor only turns its actions into dials, timers and link
//! shutdowns, and turns their completions back into inputs.
//!
//! LIFECYCLE
//! =========
//! 1. `maintain` / `connect_once` → dial task spawned
//! 2. Dial succeeds → the stream is handed to the [`Link`], which owns it
//!    until it ends or is told to shut down
//! 3. Link ends → `Closed` → retry timer armed (auto-reconnect) or stop
//! 4. `disconnect` → timer disarmed, link shut down, ack once closed
//!
//! Dropping the [`DurableConnection`] handle stops the actor and shuts the
//! live link down.

pub(crate) mod machine;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigPatch, ConnectionConfig};
use crate::error::{ClientError, ConfigError, TransportError};

use self::machine::{Action, Input, Machine};
pub use self::machine::{ConnectionEvent, ConnectionState};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Owner of one established stream for its whole lifetime.
///
/// `run` returns when the peer closes the stream, when it fails, or when
/// `shutdown` fires (or its sender is dropped). `Ok` means a clean close.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn run(
        &self,
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<(), TransportError>;
}

// =============================================================================
// HANDLE
// =============================================================================

enum Command {
    Connect {
        once: bool,
        patch: Option<ConfigPatch>,
        ack: oneshot::Sender<Result<(), ConfigError>>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the connection actor. Cheap to share behind an `Arc`.
pub struct DurableConnection {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl DurableConnection {
    /// Validate `config` and spawn the actor. Must be called inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(config: ConnectionConfig, link: Arc<dyn Link>) -> Result<Self, ConfigError> {
        Self::with_id(Uuid::new_v4(), config, link)
    }

    /// Like [`Self::new`], tagging the actor's log lines with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn with_id(id: Uuid, config: ConnectionConfig, link: Arc<dyn Link>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let actor = Actor {
            id,
            machine: Machine::new(&config),
            config: Arc::new(config),
            link,
            events: events.clone(),
            state: state_tx,
            dial: None,
            running: None,
            shutdown: None,
            timer: None,
            waiting: Vec::new(),
        };
        tokio::spawn(actor.run(commands_rx));

        Ok(Self { id, commands: commands_tx, events, state: state_rx })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// One attempt, no auto-reconnect. Resolves once the dial is started.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] when the patch produces an invalid config,
    /// [`ClientError::Shutdown`] when the actor is gone.
    pub async fn connect_once(&self, patch: Option<ConfigPatch>) -> Result<(), ClientError> {
        self.connect(true, patch).await
    }

    /// Enable auto-reconnect, reset the backoff and dial. Resolves once the
    /// first attempt is started, not when it succeeds.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect_once`].
    pub async fn maintain(&self, patch: Option<ConfigPatch>) -> Result<(), ClientError> {
        self.connect(false, patch).await
    }

    /// Stop reconnecting and close the live link. Resolves once closed.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] when the actor is gone.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (ack, done) = oneshot::channel();
        self.commands.send(Command::Disconnect { ack }).await.map_err(|_| ClientError::Shutdown)?;
        done.await.map_err(|_| ClientError::Shutdown)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn connect(&self, once: bool, patch: Option<ConfigPatch>) -> Result<(), ClientError> {
        let (ack, done) = oneshot::channel();
        self.commands.send(Command::Connect { once, patch, ack }).await.map_err(|_| ClientError::Shutdown)?;
        done.await.map_err(|_| ClientError::Shutdown)??;
        Ok(())
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Actor {
    id: Uuid,
    config: Arc<ConnectionConfig>,
    machine: Machine,
    link: Arc<dyn Link>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    dial: Option<JoinHandle<Result<TcpStream, TransportError>>>,
    running: Option<JoinHandle<Result<(), TransportError>>>,
    shutdown: Option<oneshot::Sender<()>>,
    timer: Option<Pin<Box<Sleep>>>,
    waiting: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let inputs = tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command)
                }
                dialed = join_slot(&mut self.dial) => {
                    self.dial = None;
                    self.on_dialed(dialed)
                }
                ended = join_slot(&mut self.running) => {
                    self.running = None;
                    self.shutdown = None;
                    on_link_end(ended)
                }
                () = fire(&mut self.timer) => {
                    self.timer = None;
                    debug!(conn_id = %self.id, "conn: retry timer fired");
                    vec![Input::TimerFired]
                }
            };
            self.feed(inputs);
        }

        debug!(conn_id = %self.id, "conn: handle dropped, stopping");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
    }

    fn on_command(&mut self, command: Command) -> Vec<Input> {
        match command {
            Command::Connect { once, patch, ack } => {
                if let Some(patch) = patch {
                    match self.config.merged(&patch) {
                        Ok(next) => {
                            self.machine.reconfigure(&next);
                            self.config = Arc::new(next);
                        }
                        Err(e) => {
                            warn!(conn_id = %self.id, error = %e, "conn: rejected config patch");
                            let _ = ack.send(Err(e));
                            return Vec::new();
                        }
                    }
                }
                let _ = ack.send(Ok(()));
                vec![if once { Input::ConnectOnce } else { Input::Maintain }]
            }
            Command::Disconnect { ack } => {
                self.waiting.push(ack);
                vec![Input::Disconnect]
            }
        }
    }

    fn on_dialed(&mut self, dialed: Result<Result<TcpStream, TransportError>, JoinError>) -> Vec<Input> {
        match dialed {
            Ok(Ok(stream)) => {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let link = Arc::clone(&self.link);
                let config = Arc::clone(&self.config);
                self.shutdown = Some(shutdown_tx);
                self.running = Some(tokio::spawn(async move { link.run(stream, config, shutdown_rx).await }));
                vec![Input::Established]
            }
            Ok(Err(e)) => vec![Input::Fault(Arc::new(e)), Input::Closed { had_error: true }],
            Err(e) if e.is_cancelled() => Vec::new(),
            Err(e) => vec![Input::Fault(Arc::new(TransportError::Aborted(e.to_string()))), Input::Closed { had_error: true }],
        }
    }

    fn feed(&mut self, inputs: Vec<Input>) {
        let mut queue: VecDeque<Input> = inputs.into();
        while let Some(input) = queue.pop_front() {
            let now = Instant::now();
            if matches!(input, Input::Established) {
                let down_for = self.machine.closed_at().map(|at| now.saturating_duration_since(at));
                info!(conn_id = %self.id, addr = %self.config.addr(), ?down_for, "conn: established");
            }
            for action in self.machine.handle(input, now) {
                self.apply(action, &mut queue);
            }
            self.state.send_replace(self.machine.state());
        }
    }

    fn apply(&mut self, action: Action, queue: &mut VecDeque<Input>) {
        match action {
            Action::Dial => {
                let addr = self.config.addr();
                debug!(conn_id = %self.id, %addr, "conn: dialing");
                self.dial = Some(tokio::spawn(async move {
                    let dialed = TcpStream::connect(&addr).await;
                    dialed.map_err(|source| TransportError::Connect { addr, source })
                }));
            }
            Action::Schedule(delay) => {
                self.timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::CancelTimer => {
                debug!(conn_id = %self.id, "conn: retry timer disarmed");
                self.timer = None;
            }
            Action::Shutdown => {
                if let Some(shutdown) = self.shutdown.take() {
                    let _ = shutdown.send(());
                } else if let Some(dial) = self.dial.take() {
                    dial.abort();
                    queue.push_back(Input::Closed { had_error: false });
                }
            }
            Action::Disconnected => {
                info!(conn_id = %self.id, "conn: disconnected");
                for ack in self.waiting.drain(..) {
                    let _ = ack.send(());
                }
            }
            Action::Emit(event) => {
                self.log_event(&event);
                let _ = self.events.send(event);
            }
        }
    }

    fn log_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::Reconnected(count) => info!(conn_id = %self.id, count, "conn: reconnected"),
            ConnectionEvent::Closed { had_error } => {
                info!(conn_id = %self.id, had_error, auto_reconnect = self.machine.auto_reconnect(), "conn: closed");
            }
            ConnectionEvent::Error(e) => warn!(conn_id = %self.id, error = %e, "conn: transport error"),
            ConnectionEvent::ReconnectScheduled { delay } => {
                info!(
                    conn_id = %self.id,
                    delay_ms = delay.as_millis(),
                    next_delay_ms = self.machine.next_delay().as_millis(),
                    reconnects = self.machine.reconnects(),
                    "conn: reconnect scheduled"
                );
            }
        }
    }
}

fn on_link_end(ended: Result<Result<(), TransportError>, JoinError>) -> Vec<Input> {
    match ended {
        Ok(Ok(())) => vec![Input::Closed { had_error: false }],
        Ok(Err(e)) => vec![Input::Fault(Arc::new(e)), Input::Closed { had_error: true }],
        Err(e) => vec![Input::Fault(Arc::new(TransportError::Aborted(e.to_string()))), Input::Closed { had_error: true }],
    }
}

async fn join_slot<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
