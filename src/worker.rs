//! Per-connection worker task
//!
//! One task per `connect()`. Each loop iteration runs the action of the
//! current [`State`] and stores the state it returns. All transitions
//! happen here; the application side only sets flags and enqueues frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::{Config, MAX_FRAME_HEADER_SIZE};
use crate::client::{Connection, Endpoint};
use crate::error::{ConnectionError, Error, ErrorCode};
use crate::frame::OpCode;
use crate::handshake::{self, HandshakeParams};
use crate::protocol::{Event, Protocol};
use crate::state::{Backoff, State};
use crate::transport::{Transport, connect_with_retry, send_with_timeout};

const CLOSED_BY_ENDPOINT: &str = "Connection was closed by endpoint";

pub(crate) struct Worker<T: Transport> {
    conn: Connection,
    transport: T,
    endpoint: Endpoint,
    config: Config,
    protocol: Protocol,
    backoff: Backoff,
    read_buf: BytesMut,
    events: Vec<Event>,
    handshake_key: String,
    handshake_deadline: Option<Instant>,
    transport_open: bool,
    close_sent: bool,
    keepalive: Option<JoinHandle<()>>,
}

impl<T: Transport> Worker<T> {
    pub(crate) fn new(conn: Connection, transport: T, endpoint: Endpoint, config: Config) -> Self {
        Self {
            conn,
            transport,
            protocol: Protocol::new(config.binary_delivery, config.max_message_size),
            backoff: Backoff::new(config.min_poll_interval, config.max_poll_interval),
            read_buf: BytesMut::with_capacity(config.recv_buffer_size),
            events: Vec::new(),
            handshake_key: String::new(),
            handshake_deadline: None,
            transport_open: false,
            close_sent: false,
            keepalive: None,
            endpoint,
            config,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let next = match self.conn.state() {
                State::ConnectingToHost => self.connect_to_host().await,
                State::SendingHandshake => self.send_handshake().await,
                State::WaitingHandshakeResponse => self.wait_handshake_response().await,
                State::InformConnected => self.inform_connected(),
                State::SteadyState => self.steady_state().await,
                State::Disconnecting => self.disconnecting().await,
                State::InformDisconnected => self.inform_disconnected().await,
                State::Idle | State::Terminated => break,
            };
            // Terminated is published by shutdown, once cleanup is done
            if next == State::Terminated {
                break;
            }
            self.conn.set_state(next);
        }

        self.shutdown().await;
    }

    async fn connect_to_host(&mut self) -> State {
        let Endpoint { host, port, .. } = &self.endpoint;

        let result = tokio::select! {
            r = connect_with_retry(
                &mut self.transport,
                host,
                *port,
                self.config.connect_attempts,
                self.config.connect_retry_delay,
            ) => Some(r),
            _ = self.conn.stop_requested() => None,
        };

        match result {
            Some(Ok(())) => {
                info!(host = %host, port = *port, "connected to host");
                self.transport_open = true;
                State::SendingHandshake
            }
            Some(Err(e)) => {
                self.conn.set_error(ConnectionError::from_error(
                    ErrorCode::ConnectToHostFailed,
                    &e,
                ));
                State::Terminated
            }
            None => {
                debug!("disconnect requested while connecting");
                State::Terminated
            }
        }
    }

    async fn send_handshake(&mut self) -> State {
        if self.conn.disconnect_requested() {
            return State::Terminated;
        }

        self.handshake_key = handshake::generate_key();
        let params = HandshakeParams {
            scheme: self.endpoint.scheme,
            host: &self.endpoint.host,
            port: self.endpoint.port,
            path: &self.endpoint.path,
            subprotocol: self.config.subprotocol.as_deref(),
        };
        let request = handshake::build_request(&params, &self.handshake_key);

        match send_with_timeout(&mut self.transport, &request, self.config.write_timeout).await {
            Ok(_) => {
                trace!(len = request.len(), "handshake request sent");
                self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
                State::WaitingHandshakeResponse
            }
            Err(e) => {
                self.conn.set_error(ConnectionError::from_error(
                    ErrorCode::HandshakeSendFailed,
                    &e,
                ));
                self.close_transport().await;
                State::InformDisconnected
            }
        }
    }

    async fn wait_handshake_response(&mut self) -> State {
        let deadline = self
            .handshake_deadline
            .unwrap_or_else(|| Instant::now() + self.config.handshake_timeout);

        loop {
            if self.conn.disconnect_requested() {
                debug!("disconnect requested during handshake");
                return State::Terminated;
            }

            // (accepted, consumed)
            let parsed = match handshake::parse_response(&self.read_buf) {
                Ok(Some((res, consumed))) => {
                    let accepted = !self.config.verify_accept_key
                        || handshake::validate_accept_key(&self.handshake_key, res.accept);
                    if let Some(protocol) = res.protocol {
                        debug!(protocol, "server selected subprotocol");
                    }
                    Ok(Some((accepted, consumed)))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };

            match parsed {
                Ok(Some((true, consumed))) => {
                    self.read_buf.advance(consumed);
                    info!(host = %self.endpoint.host, path = %self.endpoint.path, "handshake accepted");
                    return State::InformConnected;
                }
                Ok(Some((false, _))) => {
                    return self.handshake_failed(ConnectionError::new(
                        ErrorCode::HandshakeParseFailed,
                        "Accept key mismatch",
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    return self.handshake_failed(ConnectionError::from_error(
                        ErrorCode::HandshakeParseFailed,
                        &e,
                    ));
                }
            }

            if Instant::now() >= deadline {
                return self.handshake_failed(ConnectionError::new(
                    ErrorCode::HandshakeParseFailed,
                    "Timed out waiting for handshake response",
                ));
            }

            match self.transport.recv(&mut self.read_buf).await {
                Ok(_) | Err(Error::WouldBlock) => {}
                Err(e) => {
                    return self.handshake_failed(ConnectionError::from_error(
                        ErrorCode::SocketReadWriteFailed,
                        &e,
                    ));
                }
            }
        }
    }

    /// Record a handshake failure; the transport is closed on shutdown
    fn handshake_failed(&mut self, error: ConnectionError) -> State {
        self.conn.set_error(error);
        State::Terminated
    }

    fn inform_connected(&mut self) -> State {
        self.conn.set_connected(true);
        self.mark_sent();
        self.backoff.reset();

        if self.config.auto_ping {
            self.keepalive = Some(spawn_keepalive(&self.conn, self.config.ping_interval));
        }

        if let Some(cb) = self.conn.callbacks().connected {
            cb(&self.conn);
        }

        State::SteadyState
    }

    /// One steady-state iteration: write, read, dispatch, sleep
    async fn steady_state(&mut self) -> State {
        if self.conn.disconnect_requested() {
            return State::Disconnecting;
        }

        if self.pong_overdue() {
            self.conn.set_error(ConnectionError::new(
                ErrorCode::PongTimeout,
                "No pong received within the pong timeout",
            ));
            return State::InformDisconnected;
        }

        let mut active = false;

        // Outbound, oldest first; the first failed write ends the connection
        let frames = self.conn.inner.send_queue.drain();
        if !frames.is_empty() {
            for frame in frames {
                let sent = tokio::select! {
                    biased;
                    r = send_with_timeout(
                        &mut self.transport,
                        &frame.bytes,
                        self.config.write_timeout,
                    ) => Some(r),
                    _ = self.conn.stop_requested() => None,
                };

                match sent {
                    Some(Ok(_)) => {
                        trace!(opcode = ?frame.opcode, len = frame.bytes.len(), "frame sent");
                    }
                    Some(Err(e)) => {
                        self.conn.set_error(ConnectionError::from_error(
                            ErrorCode::SocketReadWriteFailed,
                            &e,
                        ));
                        return State::InformDisconnected;
                    }
                    None => {
                        // The interrupted frame may be half written, so no Close follows it
                        debug!(opcode = ?frame.opcode, "disconnect requested during write");
                        self.close_sent = true;
                        return State::InformDisconnected;
                    }
                }
            }
            self.mark_sent();
            active = true;
        }

        // Inbound
        match self.transport.recv(&mut self.read_buf).await {
            Ok(n) => trace!(len = n, "bytes received"),
            Err(Error::WouldBlock) => {}
            Err(e) => {
                self.conn.set_error(ConnectionError::from_error(
                    ErrorCode::SocketReadWriteFailed,
                    &e,
                ));
                return State::InformDisconnected;
            }
        }

        let mut events = std::mem::take(&mut self.events);
        let decoded = self.protocol.process_into(&mut self.read_buf, &mut events);

        let mut peer_closed = false;
        for event in events.drain(..) {
            active = true;
            match event {
                Event::Text(text) => {
                    if let Some(cb) = self.conn.callbacks().text {
                        cb(&self.conn, &text, text.len());
                    }
                }
                Event::Binary(data, marker) => {
                    if let Some(cb) = self.conn.callbacks().binary {
                        cb(&self.conn, &data, data.len(), marker);
                    }
                }
                Event::Ping(payload) => {
                    let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + payload.len());
                    Protocol::encode_pong(&payload, &mut buf);
                    self.conn.enqueue(OpCode::Pong, buf);
                }
                Event::Pong => {
                    self.conn.inner.shared.lock().ping_sent_at = None;
                }
                Event::Close => {
                    self.conn.set_error(ConnectionError::new(
                        ErrorCode::ConnectionClosedByPeer,
                        CLOSED_BY_ENDPOINT,
                    ));
                    peer_closed = true;
                }
            }
        }
        self.events = events;

        if peer_closed {
            return State::InformDisconnected;
        }

        if let Err(e) = decoded {
            self.conn.set_error(ConnectionError::from_error(ErrorCode::ProtocolError, &e));
            return State::InformDisconnected;
        }

        if active {
            self.backoff.reset();
        } else {
            self.backoff.on_idle();
        }

        tokio::select! {
            _ = tokio::time::sleep(self.backoff.current()) => {}
            _ = self.conn.inner.wake.notified() => {}
        }

        State::SteadyState
    }

    async fn disconnecting(&mut self) -> State {
        self.conn.inner.send_queue.clear();
        self.send_close().await;
        tokio::time::sleep(self.config.close_grace).await;
        State::InformDisconnected
    }

    async fn inform_disconnected(&mut self) -> State {
        if !self.close_sent && self.transport_open {
            self.send_close().await;
        }

        self.stop_keepalive();
        self.close_transport().await;
        self.conn.set_connected(false);

        if let Some(cb) = self.conn.callbacks().disconnected {
            cb(&self.conn);
        }

        State::Terminated
    }

    /// Send a masked Close carrying the next message id
    async fn send_close(&mut self) {
        let id = self.conn.next_message_id().to_string();
        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + id.len());
        Protocol::encode_close(id.as_bytes(), &mut buf);

        match send_with_timeout(&mut self.transport, &buf, self.config.write_timeout).await {
            Ok(_) => debug!(id = %id, "close frame sent"),
            Err(e) => debug!(error = %e, "close frame not sent"),
        }
        self.close_sent = true;
    }

    fn pong_overdue(&self) -> bool {
        let Some(timeout) = self.config.pong_timeout else {
            return false;
        };
        let sent_at = self.conn.inner.shared.lock().ping_sent_at;
        matches!(sent_at, Some(at) if at.elapsed() > timeout)
    }

    fn mark_sent(&self) {
        self.conn.inner.shared.lock().last_send = Instant::now();
    }

    fn stop_keepalive(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }

    async fn close_transport(&mut self) {
        if self.transport_open {
            self.transport_open = false;
            let closing = self.transport.close();
            if tokio::time::timeout(self.config.write_timeout, closing).await.is_err() {
                debug!("transport close timed out");
            }
        }
    }

    /// Release everything, then publish `Terminated`
    ///
    /// `connect()` is rejected until the state flips, so the queue and flags
    /// cleared here still belong to this worker.
    async fn shutdown(&mut self) {
        self.stop_keepalive();
        self.close_transport().await;
        self.protocol.reset();
        self.read_buf.clear();

        {
            let mut shared = self.conn.inner.shared.lock();
            self.conn.inner.send_queue.clear();
            shared.connected = false;
            shared.ping_sent_at = None;
            debug!(from = %shared.state, to = %State::Terminated, "state transition");
            shared.state = State::Terminated;
        }
        self.conn.inner.terminated.notify_waiters();
        debug!("connection worker stopped");
    }
}

/// Spawn the keep-alive ticker for a connection
///
/// Holds only a weak reference so it never keeps the connection alive.
/// Queues a ping carrying the next message id whenever the connection is in
/// steady state and nothing has been sent for a full interval.
pub(crate) fn spawn_keepalive(conn: &Connection, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&conn.inner);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(inner) = weak.upgrade() else {
                break;
            };
            let conn = Connection::from_inner(inner);

            let idle_for = {
                let shared = conn.inner.shared.lock();
                match shared.state {
                    State::SteadyState => shared.last_send.elapsed(),
                    s if s.is_active() => continue,
                    _ => break,
                }
            };
            if idle_for < interval {
                continue;
            }

            let id = conn.next_message_id().to_string();
            let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + id.len());
            Protocol::encode_ping(id.as_bytes(), &mut buf);
            {
                let mut shared = conn.inner.shared.lock();
                if shared.ping_sent_at.is_none() {
                    shared.ping_sent_at = Some(Instant::now());
                }
            }
            conn.enqueue(OpCode::Ping, buf);
            trace!(id = %id, "keep-alive ping queued");
        }

        trace!("keep-alive stopped");
    })
}
