use tokio::time::Instant;

/// Where the drone is in its connection and flight lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    /// SDK mode has been requested but not yet acknowledged.
    Connecting,
    Connected,
    Flying,
    Landing,
    /// The link was lost. Nothing is sent until an explicit reconnect.
    Error,
}

/// Connection state as last published by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    /// When the drone last answered a command.
    pub last_seen: Option<Instant>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self { phase: Phase::Disconnected, last_seen: None }
    }
}

impl ConnectionState {
    pub fn is_flying(&self) -> bool {
        self.phase == Phase::Flying
    }

    /// Whether commands other than entering SDK mode may be sent.
    pub fn accepts_commands(&self) -> bool {
        matches!(self.phase, Phase::Connected | Phase::Flying | Phase::Landing)
    }
}
