//! Connection state machine.
//!
//! States are driven by protocol events (CONNACK, lost connection, a scheduled
//! retry, explicit close) and are exposed to consumers, never inferred by them.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in flight.
    #[default]
    Connecting,
    Connected,
    /// Connection lost; messages published now are dropped.
    Offline,
    /// A new connection attempt is in flight after going offline.
    Reconnecting,
    /// Explicitly closed or rejected. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Offline => "offline",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level occurrences that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Broker accepted the connection.
    ConnAck,
    /// Network error, ping timeout or broker-side disconnect.
    ConnectionLost,
    /// The client is about to attempt a reconnect.
    Retrying,
    /// Explicit disconnect or fatal rejection.
    Closed,
}

/// Tracks the state of one physical connection.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event. Returns the new state only when it changed.
    pub fn on_event(&mut self, event: ProtocolEvent) -> Option<ConnectionState> {
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Closed, _) => Closed,
            (_, ProtocolEvent::Closed) => Closed,
            (_, ProtocolEvent::ConnAck) => Connected,
            (_, ProtocolEvent::ConnectionLost) => Offline,
            (Offline, ProtocolEvent::Retrying) => Reconnecting,
            (state, ProtocolEvent::Retrying) => state,
        };

        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
