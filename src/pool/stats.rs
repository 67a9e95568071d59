//! Sample pool statistics

use serde::{Deserialize, Serialize};

/// Point-in-time view of a sample pool and its lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total number of slots
    pub capacity: usize,
    /// Slots on the free list
    pub free: usize,
    /// Slots loaned to a writer
    pub writing: usize,
    /// Slots sent and still referenced by readers
    pub in_flight: usize,
    /// Samples sent over the lifetime of the segment
    pub samples_sent: u64,
    /// Samples dropped by `DropOldest` overflow
    pub samples_dropped: u64,
    /// Slots force-reclaimed from dead endpoints
    pub slots_reclaimed: u64,
}

impl PoolStats {
    /// Calculate pool utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.writing + self.in_flight) as f64 / self.capacity as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "PoolStats {{ capacity: {}, free: {}, writing: {}, in_flight: {}, \
             sent: {}, dropped: {}, reclaimed: {}, utilization: {:.2}% }}",
            self.capacity,
            self.free,
            self.writing,
            self.in_flight,
            self.samples_sent,
            self.samples_dropped,
            self.slots_reclaimed,
            self.utilization() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let stats = PoolStats {
            capacity: 4,
            free: 1,
            writing: 1,
            in_flight: 2,
            ..Default::default()
        };
        assert!((stats.utilization() - 0.75).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().utilization(), 0.0);
        assert!(stats.summary().contains("in_flight: 2"));
    }
}
