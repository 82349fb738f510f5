//! Session configuration.

use std::time::Duration;

/// Production websocket endpoint; the session credential is appended.
pub const IO_ENDPOINT: &str = "wss://api.iolink.dev/v0/websocket/token/";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_BUFFER_LIMIT: usize = 1024;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Returns the sub-protocol identifier sent during the websocket handshake.
pub fn default_subprotocol() -> String {
    format!("web|{}", env!("CARGO_PKG_VERSION"))
}

/// Tunables for one io session.
#[derive(Clone, Debug)]
pub struct IoConfig {
    /// Base endpoint URL; the credential is appended verbatim.
    pub endpoint: String,
    /// Sub-protocol identifier offered on the handshake.
    pub subprotocol: String,
    /// How long a connect handshake may remain pending before it fails.
    pub connect_timeout: Duration,
    /// Fixed delay before reopening after an unexpected close.
    pub reconnect_delay: Duration,
    /// How long a requested close may go unacknowledged before the socket is
    /// forced closed.
    pub close_grace: Duration,
    /// Whether unexpected closes schedule an automatic reopen.
    pub reconnect: bool,
    /// Whether a failed connect attempt (initial or reopen) also schedules a
    /// retry after `reconnect_delay`.
    pub reconnect_on_connect_failure: bool,
    /// Cap on queued outbound frames while disconnected; `None` is unbounded.
    pub buffer_limit: Option<usize>,
    /// Fan-out capacity of the subscriber event channel.
    pub event_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            endpoint: IO_ENDPOINT.to_string(),
            subprotocol: default_subprotocol(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            close_grace: DEFAULT_CLOSE_GRACE,
            reconnect: true,
            reconnect_on_connect_failure: false,
            buffer_limit: Some(DEFAULT_BUFFER_LIMIT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl IoConfig {
    /// Sets an explicit endpoint, trimming trailing whitespace.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Overrides the handshake sub-protocol identifier.
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    /// Bounds the connect handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the fixed delay between an unexpected close and the reopen attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Enables or disables automatic reopen after unexpected closes.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Extends the reconnect policy to failed connect attempts.
    pub fn with_reconnect_on_connect_failure(mut self, retry: bool) -> Self {
        self.reconnect_on_connect_failure = retry;
        self
    }

    /// Caps the outbound buffer, or removes the cap with `None`.
    pub fn with_buffer_limit(mut self, limit: Option<usize>) -> Self {
        self.buffer_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_production() {
        let config = IoConfig::default();
        assert_eq!(config.endpoint, IO_ENDPOINT);
        assert!(config.subprotocol.starts_with("web|"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert!(config.reconnect);
        assert!(!config.reconnect_on_connect_failure);
    }

    #[test]
    fn endpoint_override_trims_trailing_whitespace() {
        let config = IoConfig::default().with_endpoint("ws://localhost:8080/token/ \n");
        assert_eq!(config.endpoint, "ws://localhost:8080/token/");
    }
}
