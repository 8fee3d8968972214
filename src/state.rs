use std::fmt;

/// Lifecycle state of a client connection.
///
/// Exactly one value is current per [`ConnectionManager`](crate::ConnectionManager).
/// Only the manager moves between states; everything else observes them through
/// [`state()`](crate::ConnectionManager::state) or a
/// [`subscribe()`](crate::ConnectionManager::subscribe) receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket, no attempt in progress.
    Disconnected,
    /// Caller-initiated connect cycle in progress.
    Connecting,
    /// Handshake completed, socket usable.
    Connected,
    /// Transport failed while connected; the monitor is retrying.
    Reconnecting,
    /// Retries exhausted or credential rejected. Only `connect()` leaves this state.
    Failed,
    /// `close()` in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            // Closing is reachable from every live state, Closed only through Closing.
            (Closing, Closed) => true,
            (Closing | Closed, _) => false,
            (_, Closing) => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting, Connecting | Connected | Failed | Disconnected) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Reconnecting | Connected | Failed | Disconnected) => true,
            _ => false,
        }
    }

    /// `true` for Closed. Failed is not terminal because `connect()` may restart it.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }

    /// `true` while a dial/handshake cycle is running.
    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }

    /// `true` once `close()` has been called.
    pub fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
