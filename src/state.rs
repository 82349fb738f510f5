//! Connection and lifecycle state types shared across the session.

use std::fmt;

/// Observable readiness of the physical socket.
///
/// Always consistent with the real socket: at most one non-`Closed` socket
/// exists per controller at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    pub fn is_connecting(self) -> bool {
        self == ConnectionState::Connecting
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Direction a pending lifecycle transition is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    On,
    Off,
}

/// Session lifecycle switch serializing start/stop/restart requests.
///
/// One tagged state: `Off`, `Pending(target)`, `On`. A `start` is accepted
/// only from `Off`; a `stop` is accepted from anything but `Off`. Reconnect
/// re-enters `Pending(On)` directly from `Off` without a caller-driven start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Off,
    Pending(Target),
    On,
}

impl Lifecycle {
    /// Whether a caller-driven `start` may begin from this state.
    pub fn can_start(self) -> bool {
        self == Lifecycle::Off
    }

    /// Whether a `stop` request has anything to act on.
    pub fn can_stop(self) -> bool {
        self != Lifecycle::Off
    }

    /// Whether the switch permits opening a socket.
    pub fn opening(self) -> bool {
        self == Lifecycle::Pending(Target::On)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Off => f.write_str("off"),
            Lifecycle::Pending(Target::On) => f.write_str("pending(on)"),
            Lifecycle::Pending(Target::Off) => f.write_str("pending(off)"),
            Lifecycle::On => f.write_str("on"),
        }
    }
}
