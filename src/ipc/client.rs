//! JSON-RPC client for the SPDK control socket.
//!
//! This module provides `Client`, an async client that owns one Unix socket
//! connection to a running SPDK application and multiplexes any number of
//! concurrent calls over it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ipc::envelope::parse_error_field;
use crate::ipc::framing::{self, ResponseEnvelope, ResponseReader};
use crate::ipc::registry::{Registry, Reply};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Requests queued for the writer task before callers wait for room.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Errors surfaced by [`Client`] and the method bindings.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to connect to the SPDK socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The connection broke; every call pending on it fails with this.
    #[error("Transport error: {0}")]
    Transport(#[source] Arc<std::io::Error>),

    /// The connection was closed while the call was pending, or before it
    /// started.
    #[error("Connection closed")]
    Closed,

    /// SPDK sent something that is not a usable response envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SPDK returned a structured error object.
    ///
    /// The display form is the canonical string matched by
    /// [`is_json_error`](crate::ipc::is_json_error).
    #[error("code: {code} msg: {message}")]
    ServerError {
        /// Method of the failed call
        method: String,
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// SPDK returned a bare error string.
    #[error("{0}")]
    ServerMessage(String),

    /// The response carried neither a result nor an error.
    #[error("Response to {method} has neither result nor error")]
    MissingResult { method: String },

    /// The parameters could not be serialized.
    #[error("Failed to serialize request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The result did not match the expected type.
    #[error("Failed to decode {method} result: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// A binding refused its arguments before sending anything.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// No response arrived in time; a late response is discarded.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call; a late response is discarded.
    #[error("Request cancelled")]
    Cancelled,
}

impl RpcError {
    /// Structured error code, if SPDK sent one.
    pub fn server_code(&self) -> Option<i64> {
        match self {
            RpcError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is a structured SPDK error with the given code; `code == 0`
    /// matches any structured error.
    ///
    /// Prefer this over the text-based [`crate::ipc::is_json_error`], which
    /// only sees the display string.
    pub fn is_json_error(&self, code: i64) -> bool {
        self.server_code()
            .is_some_and(|actual| code == 0 || actual == code)
    }

    /// Whether the connection this came from is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Closed | RpcError::Protocol(_)
        )
    }
}

/// Why the reader stopped; reproduced once per pending call.
#[derive(Debug)]
enum Teardown {
    Closed,
    Transport(Arc<std::io::Error>),
    Protocol(String),
}

impl Teardown {
    fn from_error(err: RpcError) -> Self {
        match err {
            RpcError::Transport(e) => Teardown::Transport(e),
            RpcError::Protocol(detail) => Teardown::Protocol(detail),
            RpcError::ConnectionFailed(e) => Teardown::Transport(Arc::new(e)),
            other => Teardown::Protocol(other.to_string()),
        }
    }

    fn to_error(&self) -> RpcError {
        match self {
            Teardown::Closed => RpcError::Closed,
            Teardown::Transport(e) => RpcError::Transport(Arc::clone(e)),
            Teardown::Protocol(detail) => RpcError::Protocol(detail.clone()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request handed to the writer task.
#[derive(Debug)]
struct Outgoing {
    id: u64,
    method: String,
    params: Option<Box<RawValue>>,
}

/// Unregisters a call whose request never reached the writer task.
///
/// Covers callers that drop the `invoke` future while it waits for room in
/// the write queue: no request was sent, so no response will clear the id.
struct Unsent<'a> {
    registry: &'a Registry,
    id: u64,
    armed: bool,
}

impl<'a> Unsent<'a> {
    fn new(registry: &'a Registry, id: u64) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.resolve(self.id);
        }
    }
}

/// JSON-RPC client for one SPDK connection.
///
/// A single background task reads responses and routes them by id, so
/// `invoke` may be called concurrently (for example with `tokio::join!` or
/// from tasks sharing an `Arc<Client>`) and responses may come back in any
/// order. A second task owns the write half and puts queued requests on the
/// wire one whole request at a time, so dropping an `invoke` future never
/// leaves a partial request on the socket.
///
/// # Connection Lifecycle
///
/// - `connect()` - Establish the connection and start the reader
/// - `connect_with_retry()` - Retry connection with exponential backoff
/// - `invoke()` - Send a request and wait for its response (with timeout)
/// - `close()` - Tear down the connection and fail pending calls
///
/// # Example
///
/// ```ignore
/// use spdkctrl::ipc::Client;
///
/// let client = Client::connect("/var/tmp/spdk.sock").await?;
/// let bdevs: serde_json::Value = client.invoke("bdev_get_bdevs", None::<&()>).await?;
/// client.close().await?;
/// ```
pub struct Client {
    /// Queue feeding the writer task; taken by `close`.
    outgoing: Mutex<Option<mpsc::Sender<Outgoing>>>,
    /// The writer task; yields the result of shutting down the write half.
    writer: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    /// Calls awaiting a response.
    registry: Arc<Registry>,
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    /// Per-call timeout; `None` waits forever.
    timeout: Option<Duration>,
    /// Stops the reader task.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// The reader task.
    reader: Mutex<Option<JoinHandle<()>>>,
    socket_path: Option<PathBuf>,
}

impl Client {
    /// Connect to the SPDK application at the given socket path.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionFailed` if:
    /// - The socket file does not exist
    /// - Connection is refused (SPDK not running)
    /// - Permission denied (socket permissions not relaxed yet)
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(RpcError::ConnectionFailed)?;

        debug!(socket = %socket_path.display(), "connected to SPDK");
        let mut client = Self::from_stream(stream);
        client.socket_path = Some(socket_path.to_path_buf());
        Ok(client)
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Useful right after starting SPDK, while the socket may still refuse
    /// connections. Retries with delays of 100ms, 200ms, 400ms, etc.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all attempts fail.
    pub async fn connect_with_retry(
        socket_path: impl AsRef<Path>,
        max_attempts: u32,
    ) -> Result<Self, RpcError> {
        let socket_path = socket_path.as_ref();
        let mut last_error = None;

        for attempt in 1..=max_attempts.max(1) {
            match Self::connect(socket_path).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(attempt, error = %e, "connect failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        // Exponential backoff: 100ms, 200ms, 400ms, ...
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(RpcError::Closed))
    }

    /// Wrap an already-connected stream.
    ///
    /// Must be called from within a Tokio runtime; the reader task is
    /// spawned immediately.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let reader = tokio::spawn(Self::read_loop(
            ResponseReader::new(read_half),
            Arc::clone(&registry),
            shutdown_rx,
        ));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(Self::write_loop(
            write_half,
            Arc::clone(&registry),
            outgoing_rx,
        ));

        Self {
            outgoing: Mutex::new(Some(outgoing_tx)),
            writer: Mutex::new(Some(writer)),
            registry,
            next_id: AtomicU64::new(1),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(Some(reader)),
            socket_path: None,
        }
    }

    /// Set the per-call timeout. `None` disables it.
    ///
    /// Default is 30 seconds.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket this client was connected to, if it was dialed by path.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Number of calls written (or about to be) and not yet answered,
    /// abandoned calls included.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    /// Invoke `method` and decode its result as `R`.
    ///
    /// `params` of `None` omits the `params` member from the request.
    /// Use `serde::de::IgnoredAny` for `R` to discard the result.
    ///
    /// # Errors
    ///
    /// - `RpcError::ServerError` / `RpcError::ServerMessage` if SPDK reports
    ///   a failure
    /// - `RpcError::Timeout` if no response arrives in time
    /// - `RpcError::Transport`, `RpcError::Closed`, `RpcError::Protocol` if
    ///   the connection breaks
    /// - `RpcError::Decode` if the result does not fit `R`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let deleted: bool = client
    ///     .invoke("bdev_malloc_delete", Some(&json!({"name": "Malloc0"})))
    ///     .await?;
    /// ```
    pub async fn invoke<P, R>(&self, method: &str, params: Option<&P>) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.invoke_with_cancel(method, params, std::future::pending::<()>())
            .await
    }

    /// Like [`Client::invoke`], but gives up as soon as `cancel` completes.
    ///
    /// SPDK cannot recall a request once it is on the wire. If `cancel` fires
    /// after the request was written, the call stays registered and its
    /// eventual response is read and discarded.
    pub async fn invoke_with_cancel<P, R, C>(
        &self,
        method: &str,
        params: Option<&P>,
        cancel: C,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let params = params
            .map(serde_json::value::to_raw_value)
            .transpose()
            .map_err(RpcError::Encode)?;

        let outgoing = lock(&self.outgoing).clone().ok_or(RpcError::Closed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply_rx = self.registry.register(id, method)?;
        let unsent = Unsent::new(&self.registry, id);
        tokio::pin!(cancel);

        let request = Outgoing {
            id,
            method: method.to_string(),
            params,
        };
        tokio::select! {
            biased;
            // Nothing was queued; `unsent` unregisters the id.
            _ = &mut cancel => return Err(RpcError::Cancelled),
            queued = outgoing.send(request) => {
                if queued.is_err() {
                    return Err(RpcError::Closed);
                }
            }
        }
        // From here the writer task either sends the request whole or, if
        // nobody waits for it any more, drops it unsent.
        unsent.disarm();
        drop(outgoing);
        debug!(id, method, "request queued");

        let reply = tokio::select! {
            biased;
            _ = &mut cancel => Err(RpcError::Cancelled),
            reply = Self::await_reply(reply_rx, self.timeout) => reply,
        };

        match reply {
            Ok(body) => framing::decode_body(method, &body),
            Err(e @ (RpcError::Cancelled | RpcError::Timeout(_))) => {
                debug!(id, method, "abandoning call; its response will be discarded");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn await_reply(
        reply_rx: oneshot::Receiver<Reply>,
        limit: Option<Duration>,
    ) -> Result<Box<RawValue>, RpcError> {
        let received = match limit {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| RpcError::Timeout(limit))?,
            None => reply_rx.await,
        };

        // A dropped sender means the registry was torn down without a verdict.
        received.map_err(|_| RpcError::Closed)?
    }

    /// Close the connection.
    ///
    /// Stops the reader, fails every pending call with `RpcError::Closed`
    /// and shuts down the write half. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), RpcError> {
        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(());
        }

        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!(error = %e, "SPDK reader task failed");
            }
        }

        // The writer exits once the last queue sender is gone.
        drop(lock(&self.outgoing).take());
        let writer = lock(&self.writer).take();
        let Some(writer) = writer else {
            return Ok(());
        };
        match writer.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if framing::is_connection_closed(&e) => Ok(()),
            Ok(Err(e)) => Err(RpcError::Transport(Arc::new(e))),
            Err(e) => {
                warn!(error = %e, "SPDK writer task failed");
                Ok(())
            }
        }
    }

    /// Writer task: send queued requests in order, each one whole.
    async fn write_loop(
        mut writer: OwnedWriteHalf,
        registry: Arc<Registry>,
        mut outgoing: mpsc::Receiver<Outgoing>,
    ) -> std::io::Result<()> {
        while let Some(request) = outgoing.recv().await {
            if !registry.is_waiting(request.id) {
                // Abandoned while queued, or failed by a teardown.
                registry.resolve(request.id);
                debug!(id = request.id, method = %request.method, "dropping unsent request");
                continue;
            }

            let written = framing::write_request(
                &mut writer,
                request.id,
                &request.method,
                request.params.as_deref(),
            )
            .await;
            if let Err(e) = written {
                if let Some(call) = registry.resolve(request.id) {
                    call.complete(Err(e));
                }
            }
        }

        writer.shutdown().await
    }

    /// Reader task: decode envelopes in order and route them by id.
    async fn read_loop(
        mut reader: ResponseReader<OwnedReadHalf>,
        registry: Arc<Registry>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let teardown = loop {
            let next = tokio::select! {
                _ = &mut shutdown => break Teardown::Closed,
                next = reader.read_response() => next,
            };

            match next {
                Ok(Some(envelope)) => {
                    if let Err(teardown) = Self::dispatch(&registry, envelope) {
                        break teardown;
                    }
                }
                Ok(None) => {
                    debug!("SPDK closed the connection");
                    break Teardown::Closed;
                }
                Err(e) => break Teardown::from_error(e),
            }
        };

        let pending = registry.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason = ?teardown, "failing pending calls");
        }
        for (_, call) in pending {
            call.complete(Err(teardown.to_error()));
        }
    }

    /// Deliver one envelope to its waiter.
    fn dispatch(registry: &Registry, envelope: ResponseEnvelope) -> Result<(), Teardown> {
        let id = envelope.id;

        if registry.is_empty() {
            return Err(Teardown::Protocol(format!(
                "response with id {id} while no call is in flight"
            )));
        }
        let Some(call) = registry.resolve(id) else {
            warn!(id, "discarding response for unknown request id");
            return Ok(());
        };

        let reply = match envelope.error.as_ref() {
            Some(error) => match parse_error_field(&call.method, error) {
                Ok(err) => Err(err),
                Err(detail) => {
                    call.complete(Err(RpcError::Protocol(detail.clone())));
                    return Err(Teardown::Protocol(detail));
                }
            },
            None => envelope.result.ok_or_else(|| RpcError::MissingResult {
                method: call.method.clone(),
            }),
        };

        if let Err(ref err) = reply {
            debug!(id, method = %call.method, error = %err, "call failed");
        }
        let method = call.method.clone();
        if !call.complete(reply) {
            debug!(id, method = %method, "discarding response for abandoned call");
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
    }
}
