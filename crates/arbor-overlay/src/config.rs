use std::time::Duration;

use arbor_transport::TransportConfig;

/// Configuration for a [`Host`](crate::Host).
///
/// ```rust
/// use arbor_overlay::HostConfig;
/// use std::time::Duration;
///
/// let config = HostConfig::new()
///     .pending_timeout(Duration::from_secs(5))
///     .inbound_buffer(64);
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub(crate) transport: TransportConfig,
    /// Capacity of the queue between connection readers and the pump.
    pub(crate) inbound_buffer: usize,
    /// How long parked data and trees wait for their topology.
    pub(crate) pending_timeout: Duration,
    /// How often the pump evicts expired pending entries.
    pub(crate) pending_sweep_interval: Duration,
    /// Number of finished instance tokens remembered to reject late traffic.
    pub(crate) finished_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfig {
    /// Defaults. `ARBOR_PENDING_TIMEOUT_SECS` overrides the pending timeout.
    pub fn new() -> Self {
        let pending_timeout = std::env::var("ARBOR_PENDING_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Self {
            transport: TransportConfig::new(),
            inbound_buffer: 1024,
            pending_timeout,
            pending_sweep_interval: Duration::from_secs(5),
            finished_capacity: 4096,
        }
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity.max(1);
        self
    }

    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Clamped to at least one millisecond.
    pub fn pending_sweep_interval(mut self, interval: Duration) -> Self {
        self.pending_sweep_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacities_are_clamped() {
        let config = HostConfig::new()
            .inbound_buffer(0)
            .finished_capacity(0)
            .pending_sweep_interval(Duration::ZERO);
        assert_eq!(config.inbound_buffer, 1);
        assert_eq!(config.finished_capacity, 1);
        assert_eq!(config.pending_sweep_interval, Duration::from_millis(1));
    }
}
