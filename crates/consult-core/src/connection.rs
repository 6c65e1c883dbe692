use crate::{error::SyncError, types::ConnectionState};

/// Push-channel lifecycle machine.
///
/// Every transition is triggered by a transport signal, not a timer.
/// An authentication failure is terminal: the machine lands in
/// `Disconnected` and the owner must re-open with fresh credentials.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Current channel state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a channel is open or in the process of (re)opening.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ConnectionState::Disconnected)
    }

    /// An open was requested: Disconnected → Connecting.
    pub fn on_open_requested(&mut self) -> Result<ConnectionState, SyncError> {
        if self.state != ConnectionState::Disconnected {
            return Err(SyncError::invalid_transition(self.state, "open"));
        }
        self.state = ConnectionState::Connecting;
        Ok(self.state)
    }

    /// The transport handshake completed: Connecting|Reconnecting → Connected.
    pub fn on_connected(&mut self) -> Result<ConnectionState, SyncError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connected;
                Ok(self.state)
            }
            other => Err(SyncError::invalid_transition(other, "connected")),
        }
    }

    /// A connect or reconnect attempt failed.
    ///
    /// Always lands in `Disconnected`. The caller decides whether to keep
    /// retrying; after an authentication failure it must not (fresh
    /// credentials are required).
    pub fn on_connect_failed(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.state
    }

    /// The transport dropped an established channel: Connected → Reconnecting.
    pub fn on_transport_dropped(&mut self) -> Result<ConnectionState, SyncError> {
        if self.state != ConnectionState::Connected {
            return Err(SyncError::invalid_transition(self.state, "transport_drop"));
        }
        self.state = ConnectionState::Reconnecting;
        Ok(self.state)
    }

    /// The channel was torn down; idempotent from any state.
    pub fn on_closed(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.state
    }
}
