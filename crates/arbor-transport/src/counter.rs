//! Traffic accounting for connections.
//!
//! [`Counter`] is a relaxed atomic monotonic counter; [`TrafficStats`] groups
//! the four counters every connection keeps and can be summed across a host.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter backed by [`AtomicU64`].
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Per-connection byte and message counters.
#[derive(Debug, Default)]
pub struct TrafficStats {
    tx_bytes: Counter,
    rx_bytes: Counter,
    tx_msgs: Counter,
    rx_msgs: Counter,
}

impl TrafficStats {
    pub(crate) fn record_tx(&self, bytes: usize) {
        self.tx_bytes.add(bytes as u64);
        self.tx_msgs.add(1);
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        self.rx_bytes.add(bytes as u64);
        self.rx_msgs.add(1);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            tx_bytes: self.tx_bytes.get(),
            rx_bytes: self.rx_bytes.get(),
            tx_msgs: self.tx_msgs.get(),
            rx_msgs: self.rx_msgs.get(),
        }
    }
}

/// Plain-value view of [`TrafficStats`], summable across connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_msgs: u64,
    pub rx_msgs: u64,
}

impl std::ops::AddAssign for TrafficSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.tx_bytes += other.tx_bytes;
        self.rx_bytes += other.rx_bytes;
        self.tx_msgs += other.tx_msgs;
        self.rx_msgs += other.rx_msgs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.add(1);
        c.add(41);
        assert_eq!(c.get(), 42);
    }

    #[test]
    fn stats_snapshot_and_sum() {
        let a = TrafficStats::default();
        a.record_tx(10);
        a.record_rx(3);
        a.record_rx(4);

        let b = TrafficStats::default();
        b.record_tx(5);

        let mut total = a.snapshot();
        total += b.snapshot();
        assert_eq!(
            total,
            TrafficSnapshot {
                tx_bytes: 15,
                rx_bytes: 7,
                tx_msgs: 2,
                rx_msgs: 2,
            }
        );
    }

    #[test]
    fn snapshot_serializes_as_map() {
        let snap = TrafficSnapshot {
            tx_bytes: 1,
            ..Default::default()
        };
        let bytes = rmp_serde::to_vec_named(&snap).unwrap();
        let back: TrafficSnapshot = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(snap, back);
    }
}
