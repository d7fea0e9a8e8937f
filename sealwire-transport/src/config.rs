//! Transport configuration.

use std::time::Duration;

/// Default bound on establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-call socket deadline. The handshake driver wakes up at
/// least this often to check its own deadline.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(250);

const MAX_IO_TIMEOUT_MS: i64 = 3_600_000;

/// Default bound on the whole handshake, login included.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`SecureChannel`](crate::SecureChannel).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `host:port` to connect to. Unused when accepting.
    pub address: String,
    /// Bound on the TCP connect.
    pub connect_timeout: Duration,
    /// Read and write deadline applied to every socket call.
    pub io_timeout: Duration,
    /// Overall handshake deadline.
    pub handshake_timeout: Duration,
    /// How long `recv` waits for data. `None` waits until the peer closes.
    pub recv_timeout: Option<Duration>,
}

impl TransportConfig {
    /// Configuration for `address` with default timeouts.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            recv_timeout: None,
        }
    }

    /// Set the connect bound.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-call socket deadline.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the overall handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bound how long `recv` waits for data.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Socket deadline in the millisecond form session attributes take.
    /// Never zero, since zero would mean "no deadline".
    pub(crate) fn io_timeout_ms(&self) -> i64 {
        i64::try_from(self.io_timeout.as_millis())
            .unwrap_or(MAX_IO_TIMEOUT_MS)
            .clamp(1, MAX_IO_TIMEOUT_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = TransportConfig::new("127.0.0.1:7000")
            .with_io_timeout(Duration::from_millis(50))
            .with_recv_timeout(Duration::from_secs(2));
        assert_eq!(config.address, "127.0.0.1:7000");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.io_timeout_ms(), 50);
        assert_eq!(config.recv_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_sub_millisecond_io_timeout_rounds_up() {
        let config = TransportConfig::new("x").with_io_timeout(Duration::from_micros(10));
        assert_eq!(config.io_timeout_ms(), 1);
        let config = config.with_io_timeout(Duration::from_secs(86_400));
        assert_eq!(config.io_timeout_ms(), 3_600_000);
    }
}
