//! Round-trip latency samples for one connection.

use std::collections::VecDeque;

/// Bounded ring of round-trip times feeding a rolling average
#[derive(Debug, Clone)]
pub struct PingTracker {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl PingTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one completed round trip, evicting the oldest sample when full
    pub fn record(&mut self, round_trip_nanos: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(round_trip_nanos);
    }

    /// Mean of the retained samples, `None` before the first round trip
    pub fn average_nanos(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: u128 = self.samples.iter().map(|&s| u128::from(s)).sum();
        Some((total / self.samples.len() as u128) as u64)
    }

    pub fn last_nanos(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_has_no_average() {
        assert_eq!(PingTracker::new(4).average_nanos(), None);
    }

    #[test]
    fn average_covers_only_the_window() {
        let mut tracker = PingTracker::new(3);
        for sample in [100, 200, 300, 400] {
            tracker.record(sample);
        }
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.average_nanos(), Some(300));
        assert_eq!(tracker.last_nanos(), Some(400));
    }

    #[test]
    fn zero_capacity_keeps_one_sample() {
        let mut tracker = PingTracker::new(0);
        tracker.record(5);
        tracker.record(7);
        assert_eq!(tracker.average_nanos(), Some(7));
    }
}
