//! JSON-RPC correlation layer over a [`DurableConnection`].
//!
//! DESIGN
//! ======
//! [`RpcClient`] plugs a session link into the resilient connection. On every
//! established stream the link sets up the session (raw TCP or TLS), installs
//! the session writer, and reads lines until the stream ends. Each line is
//! classified by `frames`; success and error frames are routed to the pending
//! table, everything else is logged and ignored.
//!
//! Calls are handed to the writer task of the active session, which owns the
//! write half. A call made while no session is up fails with
//! [`ClientError::NotConnected`]. The call's deadline starts before the write,
//! so a peer that stops reading still yields a timeout. Once handed over, a
//! call always resolves to a [`Response`]: the peer's answer, or a synthetic
//! timeout failure.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` → `maintain` → dial
//! 2. Stream up → session setup → writer installed → status `Ready`
//! 3. Stream down → outbox removed → writer task drained or aborted → status `Down`
//! 4. Reconnect repeats 2-3 with the same session mode

pub mod pending;
pub(crate) mod correlation;
pub(crate) mod session;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Id, Parsed, Request, Response};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, SessionMode};
use crate::connection::{ConnectionEvent, ConnectionState, DurableConnection, Link};
use crate::error::{ClientError, HandshakeError, ProtocolError, TransportError};

use self::pending::{CONNECTION_CLOSED_CODE, PendingTable};
use self::session::{SessionReader, SessionWriter};

/// Lines queued for the writer task before callers wait on the channel.
const OUTBOX_CAPACITY: usize = 64;
/// How long teardown lets the writer task flush and close before aborting it.
const WRITER_DRAIN: Duration = Duration::from_millis(250);

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeOptions {
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

/// Readiness of the session on the current link.
#[derive(Debug, Clone)]
pub enum SessionStatus {
    Down,
    Ready(SessionMode),
    Failed(Arc<HandshakeError>),
}

// =============================================================================
// CLIENT
// =============================================================================

struct Shared {
    client_id: Uuid,
    config: ConnectionConfig,
    pending: PendingTable,
    outbox: Mutex<Option<mpsc::Sender<Outgoing>>>,
    session: watch::Sender<SessionStatus>,
    tls: Option<TlsConnector>,
}

/// Line-delimited JSON-RPC client with automatic reconnect.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
    conn: Arc<DurableConnection>,
}

impl RpcClient {
    /// Validate `config`, build the TLS connector if TLS material is present,
    /// and start the connection actor. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] for an invalid config and
    /// [`ClientError::Handshake`] for unusable TLS material.
    pub fn new(config: ConnectionConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = match config.session_mode() {
            SessionMode::Plain => None,
            SessionMode::Encrypted => {
                Some(session::build_connector(&config.tls).map_err(|e| ClientError::Handshake(Arc::new(e)))?)
            }
        };

        let client_id = Uuid::new_v4();
        let (session, _) = watch::channel(SessionStatus::Down);
        let shared = Arc::new(Shared {
            client_id,
            config: config.clone(),
            pending: PendingTable::new(),
            outbox: Mutex::new(None),
            session,
            tls,
        });
        let link = Arc::new(SessionLink { shared: Arc::clone(&shared) });
        let conn = DurableConnection::with_id(client_id, config, link)?;

        info!(%client_id, addr = %shared.config.addr(), mode = ?shared.config.session_mode(), "rpc: client created");
        Ok(Self { shared, conn: Arc::new(conn) })
    }

    /// Start maintaining the connection and wait until the session is ready
    /// for framed lines (after the TLS handshake in encrypted mode).
    ///
    /// # Errors
    ///
    /// [`ClientError::Handshake`] when the TLS upgrade of the attempt fails.
    /// The reconnect loop keeps running regardless.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut status = self.shared.session.subscribe();
        if matches!(*status.borrow_and_update(), SessionStatus::Ready(_)) {
            return Ok(());
        }
        self.conn.maintain(None).await?;

        loop {
            status.changed().await.map_err(|_| ClientError::Shutdown)?;
            match &*status.borrow_and_update() {
                SessionStatus::Ready(_) => return Ok(()),
                SessionStatus::Failed(e) => return Err(ClientError::Handshake(Arc::clone(e))),
                SessionStatus::Down => {}
            }
        }
    }

    /// [`Self::connect`] with a completion callback instead of a future.
    pub fn connect_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { callback(client.connect().await) })
    }

    /// Stop reconnecting and close the link. The session is torn down before
    /// this resolves.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] when the connection actor is gone.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.conn.disconnect().await?;
        if self.shared.config.fail_pending_on_disconnect {
            let failed = self.shared.pending.fail_all(CONNECTION_CLOSED_CODE, "connection closed");
            if failed > 0 {
                info!(client_id = %self.shared.client_id, failed, "rpc: failed pending calls on disconnect");
            }
        }
        Ok(())
    }

    /// [`Self::disconnect`] with a completion callback instead of a future.
    pub fn disconnect_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { callback(client.disconnect().await) })
    }

    /// Send one call and wait for its response or timeout.
    ///
    /// Peer errors and timeouts come back as `Ok` with an error-shaped
    /// [`Response`]; a timeout carries [`pending::TIMEOUT_CODE`].
    ///
    /// # Errors
    ///
    /// Only when the request could not be written: [`ClientError::NotConnected`],
    /// [`ClientError::Write`] or [`ClientError::Encode`].
    pub async fn invoke(&self, method: &str, params: Value, options: InvokeOptions) -> Result<Response, ClientError> {
        let timeout = options.timeout.unwrap_or(self.shared.config.timeout);
        let started = Instant::now();
        let slot = self.shared.pending.register();
        let request = Request::new(slot.id().clone(), method, params);

        match tokio::time::timeout(timeout, self.write(&request)).await {
            Ok(written) => written?,
            Err(_) => {
                warn!(client_id = %self.shared.client_id, id = %request.id, method, "rpc: write did not finish before the deadline");
                return Ok(slot.settle(Duration::ZERO).await);
            }
        }

        debug!(client_id = %self.shared.client_id, id = %request.id, method, timeout_ms = timeout.as_millis(), "rpc: call sent");
        Ok(slot.settle(timeout.saturating_sub(started.elapsed())).await)
    }

    async fn write(&self, request: &Request) -> Result<(), ClientError> {
        let line = frames::encode_line(request)?;
        let outbox = self.shared.outbox().clone().ok_or(ClientError::NotConnected)?;
        let (ack, written) = oneshot::channel();
        outbox.send(Outgoing { line, ack }).await.map_err(|_| ClientError::NotConnected)?;
        // A dropped ack means the session went down before the line was written.
        written.await.map_err(|_| ClientError::NotConnected)??;
        Ok(())
    }

    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    /// `true` while a session is ready for framed lines.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.session.borrow(), SessionStatus::Ready(_))
    }

    #[must_use]
    pub fn session_mode(&self) -> SessionMode {
        self.shared.config.session_mode()
    }

    #[must_use]
    pub fn session_status(&self) -> SessionStatus {
        self.shared.session.borrow().clone()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    #[must_use]
    pub fn has_pending(&self, id: &Id) -> bool {
        self.shared.pending.contains(id)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.subscribe()
    }
}

// =============================================================================
// SESSION LINK
// =============================================================================

struct SessionLink {
    shared: Arc<Shared>,
}

#[async_trait]
impl Link for SessionLink {
    async fn run(
        &self,
        stream: TcpStream,
        config: Arc<ConnectionConfig>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), TransportError> {
        let shared = &self.shared;
        let mode = config.session_mode();

        let established = tokio::select! {
            established = session::establish(stream, shared.tls.as_ref(), config.tls_server_name()) => established,
            _ = &mut shutdown => return Ok(()),
        };
        let (reader, writer) = match established {
            Ok(halves) => halves,
            Err(e) => {
                let e = Arc::new(e);
                shared.session.send_replace(SessionStatus::Failed(Arc::clone(&e)));
                return Err(TransportError::Handshake(e));
            }
        };

        let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
        let mut writer_task = tokio::spawn(write_lines(writer, inbox));
        *shared.outbox() = Some(outbox);
        shared.session.send_replace(SessionStatus::Ready(mode));
        info!(client_id = %shared.client_id, ?mode, "rpc: session ready");

        let result = shared.read_lines(reader, &mut shutdown).await;

        drop(shared.outbox().take());
        if tokio::time::timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
            writer_task.abort();
            debug!(client_id = %shared.client_id, "rpc: aborted stalled writer");
        }
        shared.session.send_replace(SessionStatus::Down);
        debug!(client_id = %shared.client_id, pending = shared.pending.len(), "rpc: session down");
        result
    }
}

/// One framed line waiting for the writer task.
struct Outgoing {
    line: String,
    ack: oneshot::Sender<std::io::Result<()>>,
}

/// Own the write half for the life of a session. Ends when every sender is
/// gone or a write fails, then closes the half.
async fn write_lines(mut writer: SessionWriter, mut inbox: mpsc::Receiver<Outgoing>) {
    while let Some(Outgoing { line, ack }) = inbox.recv().await {
        let result = write_line(&mut writer, &line).await;
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_line(writer: &mut SessionWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

impl Shared {
    fn outbox(&self) -> MutexGuard<'_, Option<mpsc::Sender<Outgoing>>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_lines(&self, reader: SessionReader, shutdown: &mut oneshot::Receiver<()>) -> Result<(), TransportError> {
        let mut lines = BufReader::new(reader).split(b'\n');
        loop {
            tokio::select! {
                _ = &mut *shutdown => return Ok(()),
                segment = lines.next_segment() => match segment? {
                    Some(bytes) => self.dispatch(&String::from_utf8_lossy(&bytes)),
                    None => return Ok(()),
                },
            }
        }
    }

    fn dispatch(&self, line: &str) {
        for frame in frames::parse_line(line) {
            let routed = match frame {
                Parsed::Success(success) => self.pending.resolve(Response::Success(success)),
                Parsed::Error(failure) => self.pending.resolve(Response::Failure(failure)),
                Parsed::Request(request) => Err(ProtocolError::Unsupported(frames::Kind::Request, request.method)),
                Parsed::Notification(note) => Err(ProtocolError::Unsupported(frames::Kind::Notification, note.method)),
                Parsed::Invalid(invalid) => Err(ProtocolError::Invalid(invalid.reason)),
            };
            match routed {
                Ok(()) => {}
                Err(e @ (ProtocolError::Invalid(_) | ProtocolError::Unroutable(_))) => {
                    warn!(client_id = %self.client_id, error = %e, "rpc: dropped frame");
                }
                Err(e) => debug!(client_id = %self.client_id, error = %e, "rpc: ignored frame"),
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
