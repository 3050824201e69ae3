//! Connection lifecycle states and the idle poll backoff

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a connection
///
/// ```text
/// Idle -> ConnectingToHost -> SendingHandshake -> WaitingHandshakeResponse
///      -> InformConnected -> SteadyState -> Disconnecting
///      -> InformDisconnected -> Terminated
/// ```
///
/// Failures jump forward: connect and handshake-response failures go
/// straight to `Terminated`, everything after the handshake request goes
/// through `InformDisconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// No worker has been started
    #[default]
    Idle,
    /// Opening the transport
    ConnectingToHost,
    /// Writing the upgrade request
    SendingHandshake,
    /// Reading the upgrade response
    WaitingHandshakeResponse,
    /// Handshake accepted, connected callback pending
    InformConnected,
    /// Exchanging frames
    SteadyState,
    /// Application asked to close, close frame being sent
    Disconnecting,
    /// Disconnected callback pending
    InformDisconnected,
    /// Worker stopped
    Terminated,
}

impl State {
    /// Whether a worker task may still be running in this state
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self, State::Idle | State::Terminated)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::ConnectingToHost => "connecting-to-host",
            State::SendingHandshake => "sending-handshake",
            State::WaitingHandshakeResponse => "waiting-handshake-response",
            State::InformConnected => "inform-connected",
            State::SteadyState => "steady-state",
            State::Disconnecting => "disconnecting",
            State::InformDisconnected => "inform-disconnected",
            State::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Sleep interval between worker iterations
///
/// Doubles after each idle iteration up to `max`, drops back to `min` as
/// soon as anything is sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    /// Interval to sleep before the next iteration
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record an iteration that neither sent nor received
    pub fn on_idle(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Record activity
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
