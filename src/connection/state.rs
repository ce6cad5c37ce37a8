//! Connection state machine
//!
//! Exactly one state is active at a time and every transition goes
//! through the legal-transition table below. Stop forces Disconnected
//! from any state.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Reconnecting
//!       ▲              │              │               │
//!       └──────────────┴──────────────┴───────────────┘
//!                  (any state ──► Disconnected)
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Reconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Connecting, Connected) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) => true,
            (Disconnected, Connecting) => true,
            // Stop forces Disconnected from any live state.
            (Connecting | Connected | Reconnecting, Disconnected) => true,
            _ => false,
        }
    }

    pub(crate) fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Payload of a state-changed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}
