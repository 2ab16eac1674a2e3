use std::time::Duration;

/// Configuration for connections opened or accepted by the transport.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use arbor_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::new()
///     .max_message_size(2 * 1024 * 1024)
///     .connect_timeout(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum frame size in bytes, enforced on both send and receive.
    pub(crate) max_message_size: usize,
    /// Upper bound for TCP connect plus identity handshake.
    pub(crate) connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    ///
    /// If the `ARBOR_MAX_MESSAGE_SIZE` environment variable holds a byte
    /// count, it replaces the 16 MiB default. It can still be overridden
    /// with [`.max_message_size()`](Self::max_message_size).
    pub fn new() -> Self {
        let max_message_size = std::env::var("ARBOR_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(16 * 1024 * 1024);

        Self {
            max_message_size,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set maximum frame size (default: 16 MiB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the connect + handshake timeout (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Configured maximum frame size.
    pub fn max_frame(&self) -> usize {
        self.max_message_size
    }
}
