//! Application-facing connection handle
//!
//! A [`Connection`] is a cheap, cloneable handle over shared state. The
//! application configures it, registers callbacks and calls
//! [`connect`](Connection::connect); a worker task then owns the lifecycle
//! while the application only enqueues sends and reads status.
//!
//! Shared state is split over two locks: one for settings, lifecycle state
//! and the last error, one (inside [`SendQueue`]) for outbound frames.
//! Neither is held while a callback runs.

use std::any::Any;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Error, ErrorCode, Result};
use crate::frame::{FragmentMarker, OpCode};
use crate::handshake::Scheme;
use crate::protocol::Protocol;
use crate::queue::SendQueue;
use crate::state::State;
use crate::transport::{DefaultTransport, Transport};
use crate::worker::Worker;
use crate::{Config, MAX_FRAME_HEADER_SIZE, MESSAGE_ID_MODULUS};

/// Called once the handshake has been accepted
pub type ConnectedCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Called once when an established (or handshaking) connection goes away
pub type DisconnectedCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Called with a complete text message and its length in bytes
pub type TextCallback = Arc<dyn Fn(&Connection, &str, usize) + Send + Sync>;
/// Called with binary data, its length and its position in the message
pub type BinaryCallback = Arc<dyn Fn(&Connection, &[u8], usize, FragmentMarker) + Send + Sync>;

/// Opaque application value carried by a connection
pub type UserObject = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) connected: Option<ConnectedCallback>,
    pub(crate) disconnected: Option<DisconnectedCallback>,
    pub(crate) text: Option<TextCallback>,
    pub(crate) binary: Option<BinaryCallback>,
}

/// Where a connection goes, validated at `connect()`
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
    pub(crate) server_cert: Option<String>,
}

/// State guarded by the command lock
pub(crate) struct Shared {
    pub(crate) scheme: Option<Scheme>,
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) path: Option<String>,
    pub(crate) server_cert: Option<String>,
    pub(crate) config: Config,
    pub(crate) state: State,
    pub(crate) connected: bool,
    pub(crate) disconnect_requested: bool,
    pub(crate) error: Option<ConnectionError>,
    pub(crate) callbacks: Callbacks,
    pub(crate) user: Option<UserObject>,
    /// Last time a frame was written
    pub(crate) last_send: Instant,
    /// When the oldest unanswered keep-alive ping was queued
    pub(crate) ping_sent_at: Option<Instant>,
    pub(crate) task: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) send_queue: SendQueue,
    /// Wakes the worker early (new send, disconnect)
    pub(crate) wake: Notify,
    /// Signalled when the worker stops
    pub(crate) terminated: Notify,
    message_id: AtomicU32,
}

/// Handle to one WebSocket connection
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Create an idle connection with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    scheme: None,
                    host: None,
                    port: None,
                    path: None,
                    server_cert: None,
                    config,
                    state: State::Idle,
                    connected: false,
                    disconnect_requested: false,
                    error: None,
                    callbacks: Callbacks::default(),
                    user: None,
                    last_send: Instant::now(),
                    ping_sent_at: None,
                    task: None,
                }),
                send_queue: SendQueue::new(),
                wake: Notify::new(),
                terminated: Notify::new(),
                message_id: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Set scheme, host, port and path from a `ws://` or `wss://` URL
    ///
    /// A missing port defaults to 80 / 443, a missing path to `/`.
    pub fn set_url(&self, url: &str) -> Result<()> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or(Error::InvalidHttp("invalid URL: missing scheme"))?;

        let scheme = Scheme::parse(scheme)
            .ok_or(Error::InvalidHttp("invalid URL scheme: expected ws or wss"))?;

        let (host_port, path) = rest
            .find('/')
            .map(|i| (&rest[..i], &rest[i..]))
            .unwrap_or((rest, "/"));

        let (host, port) = match host_port.rfind(':') {
            Some(i) if !host_port[i..].contains(']') => {
                let port: u16 = host_port[i + 1..]
                    .parse()
                    .map_err(|_| Error::InvalidHttp("invalid port"))?;
                (&host_port[..i], port)
            }
            _ => (host_port, scheme.default_port()),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.is_empty() {
            return Err(Error::InvalidHttp("invalid URL: missing host"));
        }

        let mut shared = self.inner.shared.lock();
        shared.scheme = Some(scheme);
        shared.host = Some(host.to_owned());
        shared.port = Some(port);
        shared.path = Some(path.to_owned());
        Ok(())
    }

    pub fn set_scheme(&self, scheme: Scheme) {
        self.inner.shared.lock().scheme = Some(scheme);
    }

    pub fn set_host(&self, host: impl Into<String>) {
        self.inner.shared.lock().host = Some(host.into());
    }

    pub fn set_port(&self, port: u16) {
        self.inner.shared.lock().port = Some(port);
    }

    pub fn set_path(&self, path: impl Into<String>) {
        self.inner.shared.lock().path = Some(path.into());
    }

    /// Pin the server certificate (PEM) used for `wss`
    pub fn set_server_cert(&self, pem: impl Into<String>) {
        self.inner.shared.lock().server_cert = Some(pem.into());
    }

    /// Replace the configuration used by the next `connect()`
    pub fn set_config(&self, config: Config) {
        self.inner.shared.lock().config = config;
    }

    pub fn config(&self) -> Config {
        self.inner.shared.lock().config.clone()
    }

    pub fn scheme(&self) -> Option<Scheme> {
        self.inner.shared.lock().scheme
    }

    pub fn host(&self) -> Option<String> {
        self.inner.shared.lock().host.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.shared.lock().port
    }

    pub fn path(&self) -> Option<String> {
        self.inner.shared.lock().path.clone()
    }

    pub fn server_cert(&self) -> Option<String> {
        self.inner.shared.lock().server_cert.clone()
    }

    /// Full URL, if every part has been set
    pub fn url(&self) -> Option<String> {
        let shared = self.inner.shared.lock();
        Some(format!(
            "{}://{}:{}{}",
            shared.scheme?,
            shared.host.as_deref()?,
            shared.port?,
            shared.path.as_deref()?
        ))
    }

    pub fn set_user_object(&self, user: UserObject) {
        self.inner.shared.lock().user = Some(user);
    }

    pub fn user_object(&self) -> Option<UserObject> {
        self.inner.shared.lock().user.clone()
    }

    /// The user object, if it is a `T`
    pub fn user_object_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_object()?.downcast::<T>().ok()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.connected = Some(Arc::new(f));
    }

    /// Required before `connect()`
    pub fn on_disconnected<F>(&self, f: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.disconnected = Some(Arc::new(f));
    }

    pub fn on_text<F>(&self, f: F)
    where
        F: Fn(&Connection, &str, usize) + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.text = Some(Arc::new(f));
    }

    pub fn on_binary<F>(&self, f: F)
    where
        F: Fn(&Connection, &[u8], usize, FragmentMarker) + Send + Sync + 'static,
    {
        self.inner.shared.lock().callbacks.binary = Some(Arc::new(f));
    }

    pub(crate) fn callbacks(&self) -> Callbacks {
        self.inner.shared.lock().callbacks.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the worker over the transport matching the scheme
    ///
    /// Fails immediately, without starting anything, when scheme, host,
    /// port, path or the disconnected callback is missing. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> std::result::Result<(), ConnectionError> {
        self.launch(|endpoint, config| {
            DefaultTransport::for_scheme(
                endpoint.scheme,
                config.read_timeout,
                endpoint.server_cert.as_deref(),
            )
        })
    }

    /// Start the worker over a caller-supplied transport
    pub fn connect_with<T: Transport>(
        &self,
        transport: T,
    ) -> std::result::Result<(), ConnectionError> {
        self.launch(move |_, _| Ok(transport))
    }

    fn launch<T, F>(&self, make_transport: F) -> std::result::Result<(), ConnectionError>
    where
        T: Transport,
        F: FnOnce(&Endpoint, &Config) -> Result<T>,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ConnectionError::new(
                ErrorCode::InvalidState,
                "connect() must be called within a tokio runtime",
            )
        })?;

        let mut shared = self.inner.shared.lock();
        if shared.state.is_active() {
            return Err(ConnectionError::new(
                ErrorCode::InvalidState,
                "connection is already running",
            ));
        }

        shared.error = None;

        let endpoint = match endpoint(&shared) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "connect rejected");
                shared.error = Some(e.clone());
                return Err(e);
            }
        };

        let config = shared.config.clone();
        let transport = match make_transport(&endpoint, &config) {
            Ok(transport) => transport,
            Err(e) => {
                let err = ConnectionError::from_error(ErrorCode::ConnectToHostFailed, &e);
                warn!(error = %err, "transport setup failed");
                shared.error = Some(err.clone());
                return Err(err);
            }
        };

        shared.state = State::ConnectingToHost;
        shared.connected = false;
        shared.disconnect_requested = false;
        shared.ping_sent_at = None;
        shared.last_send = Instant::now();
        self.inner.send_queue.clear();

        info!(
            scheme = %endpoint.scheme,
            host = %endpoint.host,
            port = endpoint.port,
            path = %endpoint.path,
            "starting connection"
        );

        let worker = Worker::new(self.clone(), transport, endpoint, config);
        shared.task = Some(runtime.spawn(worker.run()));
        Ok(())
    }

    /// Ask the connection to close
    ///
    /// Returns immediately. Pending sends are discarded. A connected worker
    /// sends Close, waits the grace period and fires the disconnected
    /// callback; a worker still connecting stops without callbacks. Use
    /// [`wait_terminated`](Self::wait_terminated) or [`join`](Self::join)
    /// to wait for the worker to finish.
    pub fn disconnect(&self) {
        self.inner.send_queue.clear();

        let mut shared = self.inner.shared.lock();
        if !shared.state.is_active() {
            return;
        }
        shared.disconnect_requested = true;
        debug!(state = %shared.state, "disconnect requested");
        drop(shared);

        self.inner.wake.notify_one();
    }

    /// Whether the handshake completed and the connection is up
    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().connected
    }

    pub fn state(&self) -> State {
        self.inner.shared.lock().state
    }

    /// Last recorded error, if any
    pub fn error(&self) -> Option<ConnectionError> {
        self.inner.shared.lock().error.clone()
    }

    /// Resolve once no worker is running
    pub async fn wait_terminated(&self) {
        loop {
            let mut notified = pin!(self.inner.terminated.notified());
            notified.as_mut().enable();

            if !self.state().is_active() {
                return;
            }
            notified.await;
        }
    }

    /// Await the worker task of the last `connect()`
    pub async fn join(&self) {
        let task = self.inner.shared.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "connection worker failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a text message
    pub fn send_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(Error::InvalidFrame("empty text message"));
        }
        self.ensure_sendable()?;

        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + text.len());
        Protocol::encode_text(text, &mut buf);
        self.enqueue(OpCode::Text, buf);
        Ok(())
    }

    /// Queue one chunk of a binary message
    ///
    /// `Start` and `Continue` chunks are sent without FIN; the message is
    /// finished by an `End` chunk (which may be empty). `Whole` sends an
    /// unfragmented message.
    pub fn send_binary(&self, data: &[u8], marker: FragmentMarker) -> Result<()> {
        self.ensure_sendable()?;

        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + data.len());
        Protocol::encode_binary(data, marker, &mut buf);
        self.enqueue(marker.wire_opcode(OpCode::Binary), buf);
        Ok(())
    }

    fn ensure_sendable(&self) -> Result<()> {
        let shared = self.inner.shared.lock();
        let accepting = matches!(
            shared.state,
            State::ConnectingToHost
                | State::SendingHandshake
                | State::WaitingHandshakeResponse
                | State::InformConnected
                | State::SteadyState
        );
        if !accepting || shared.disconnect_requested {
            return Err(Error::InvalidState("connection is not open for sending"));
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, opcode: OpCode, frame: BytesMut) {
        self.inner.send_queue.push(opcode, frame.freeze());
        self.inner.wake.notify_one();
    }

    /// Next message id, wrapping below [`MESSAGE_ID_MODULUS`]
    pub(crate) fn next_message_id(&self) -> u32 {
        let advance = |id: u32| Some((id + 1) % MESSAGE_ID_MODULUS);
        match self
            .inner
            .message_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(prev) | Err(prev) => (prev + 1) % MESSAGE_ID_MODULUS,
        }
    }

    // ------------------------------------------------------------------
    // Worker-side accessors
    // ------------------------------------------------------------------

    pub(crate) fn set_state(&self, next: State) {
        let mut shared = self.inner.shared.lock();
        if shared.state != next {
            debug!(from = %shared.state, to = %next, "state transition");
            shared.state = next;
        }
    }

    pub(crate) fn set_error(&self, error: ConnectionError) {
        warn!(code = error.code().as_i32(), error = %error, "connection error");
        self.inner.shared.lock().error = Some(error);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.inner.shared.lock().connected = connected;
    }

    pub(crate) fn disconnect_requested(&self) -> bool {
        self.inner.shared.lock().disconnect_requested
    }

    /// Resolve once `disconnect()` has been called
    pub(crate) async fn stop_requested(&self) {
        loop {
            let mut notified = pin!(self.inner.wake.notified());
            notified.as_mut().enable();

            if self.disconnect_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Validate the connection fields needed to start
fn endpoint(shared: &Shared) -> std::result::Result<Endpoint, ConnectionError> {
    let missing = |what: &str| ConnectionError::new(ErrorCode::MissingParameter, what);

    let scheme = shared
        .scheme
        .ok_or_else(|| missing("No URL scheme provided"))?;
    let host = shared
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| missing("No URL host provided"))?;
    let port = shared
        .port
        .filter(|p| *p != 0)
        .ok_or_else(|| missing("No URL port provided"))?;
    let path = shared
        .path
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| missing("No URL path provided"))?;

    if shared.callbacks.disconnected.is_none() {
        return Err(missing("No on_disconnected callback provided"));
    }

    Ok(Endpoint {
        scheme,
        host,
        port,
        path,
        server_cert: shared.server_cert.clone(),
    })
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Connection")
            .field("scheme", &shared.scheme)
            .field("host", &shared.host)
            .field("port", &shared.port)
            .field("path", &shared.path)
            .field("state", &shared.state)
            .field("connected", &shared.connected)
            .field("error", &shared.error)
            .finish()
    }
}
