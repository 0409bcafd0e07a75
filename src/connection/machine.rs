//! Pure transition table of the resilient connection.
//!
//! The machine performs no I/O. The actor feeds it [`Input`]s as commands,
//! dial results, link completions and timer expiries arrive, and carries out
//! the returned [`Action`]s in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::error::TransportError;

/// Lifecycle of the one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// A dial is in flight.
    Connecting,
    /// A link owns an established stream.
    Open,
    /// A retry timer is armed.
    ReconnectPending,
    /// Closed and not retrying.
    Closed,
}

/// Observable connection events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    /// A connection following a prior close was established while
    /// auto-reconnect was on. Carries the running reconnect count.
    Reconnected(u64),
    Closed {
        had_error: bool,
    },
    Error(Arc<TransportError>),
    ReconnectScheduled {
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Input {
    ConnectOnce,
    Maintain,
    Established,
    Closed { had_error: bool },
    Fault(Arc<TransportError>),
    TimerFired,
    Disconnect,
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
    Dial,
    Schedule(Duration),
    CancelTimer,
    /// End the live link or abandon the in-flight dial. The actor reports the
    /// outcome back as [`Input::Closed`].
    Shutdown,
    /// An explicit disconnect has completed.
    Disconnected,
    Emit(ConnectionEvent),
}

#[derive(Debug)]
pub(crate) struct Machine {
    state: ConnectionState,
    backoff: Backoff,
    auto_reconnect: bool,
    closing: bool,
    redial: bool,
    after_close: bool,
    reconnects: u64,
    opened_at: Option<Instant>,
    closed_at: Option<Instant>,
}

impl Machine {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff: Backoff::from_config(config),
            auto_reconnect: false,
            closing: false,
            redial: false,
            after_close: false,
            reconnects: 0,
            opened_at: None,
            closed_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    /// Delay the next failure-driven retry would wait.
    pub fn next_delay(&self) -> Duration {
        self.backoff.current()
    }

    pub fn reconfigure(&mut self, config: &ConnectionConfig) {
        self.backoff.reconfigure(config);
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        match input {
            Input::ConnectOnce => {
                self.auto_reconnect = false;
                self.begin()
            }
            Input::Maintain => {
                self.auto_reconnect = true;
                self.backoff.reset();
                self.begin()
            }
            Input::Established => self.established(now),
            Input::Closed { had_error } => self.closed(had_error, now),
            Input::Fault(err) => vec![Action::Emit(ConnectionEvent::Error(err))],
            Input::TimerFired => {
                if self.state != ConnectionState::ReconnectPending {
                    return Vec::new();
                }
                self.state = ConnectionState::Connecting;
                vec![Action::Dial]
            }
            Input::Disconnect => self.disconnect(),
        }
    }

    fn begin(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => {
                self.state = ConnectionState::Connecting;
                vec![Action::Dial]
            }
            ConnectionState::ReconnectPending => {
                self.state = ConnectionState::Connecting;
                vec![Action::CancelTimer, Action::Dial]
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                if self.closing {
                    self.redial = true;
                }
                Vec::new()
            }
        }
    }

    fn established(&mut self, now: Instant) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        self.opened_at = Some(now);

        let mut actions = vec![Action::Emit(ConnectionEvent::Connected)];
        if self.auto_reconnect && self.after_close {
            self.reconnects += 1;
            actions.push(Action::Emit(ConnectionEvent::Reconnected(self.reconnects)));
        }
        actions
    }

    fn closed(&mut self, had_error: bool, now: Instant) -> Vec<Action> {
        if !matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            return Vec::new();
        }
        let uptime = self.opened_at.take().map(|opened| now.saturating_duration_since(opened));
        self.closed_at = Some(now);

        let mut actions = vec![Action::Emit(ConnectionEvent::Closed { had_error })];

        if self.closing {
            self.closing = false;
            actions.push(Action::Disconnected);
            if std::mem::take(&mut self.redial) {
                self.state = ConnectionState::Connecting;
                actions.push(Action::Dial);
            } else {
                self.state = ConnectionState::Closed;
            }
            return actions;
        }

        if !self.auto_reconnect {
            self.state = ConnectionState::Closed;
            return actions;
        }

        self.after_close = true;
        if uptime.is_some_and(|up| up > self.backoff.min()) {
            self.backoff.reset();
        }
        let delay = self.backoff.advance();
        self.state = ConnectionState::ReconnectPending;
        actions.push(Action::Schedule(delay));
        actions.push(Action::Emit(ConnectionEvent::ReconnectScheduled { delay }));
        actions
    }

    fn disconnect(&mut self) -> Vec<Action> {
        self.auto_reconnect = false;
        self.after_close = false;
        self.redial = false;
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => vec![Action::Disconnected],
            ConnectionState::ReconnectPending => {
                self.state = ConnectionState::Closed;
                vec![Action::CancelTimer, Action::Disconnected]
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                if self.closing {
                    return Vec::new();
                }
                self.closing = true;
                vec![Action::Shutdown]
            }
        }
    }
}

#[cfg(test)]
#[path = "machine_test.rs"]
mod tests;
