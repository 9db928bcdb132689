//! A mapping from metric name to a monotonically non-decreasing counter.
//! Single writer per counter from the serving callback; readers see
//! eventually-consistent counts, but no increment is ever lost.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REQUESTS_EXCLUDED: &str = "requests_excluded";
pub const REQUESTS_DISRUPTED: &str = "requests_disrupted";

#[derive(Debug, Default)]
pub struct MetricMap {
    counters: DashMap<&'static str, AtomicU64>,
}

impl MetricMap {
    pub fn new() -> Self {
        let map = Self::default();
        for name in [REQUESTS_TOTAL, REQUESTS_EXCLUDED, REQUESTS_DISRUPTED] {
            map.counters.insert(name, AtomicU64::new(0));
        }
        map
    }

    pub fn increment(&self, name: &'static str) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn requests_total(&self) -> u64 {
        self.get(REQUESTS_TOTAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_monotonically_increase() {
        let metrics = MetricMap::new();
        assert_eq!(metrics.requests_total(), 0);

        metrics.increment(REQUESTS_TOTAL);
        metrics.increment(REQUESTS_TOTAL);
        metrics.increment(REQUESTS_EXCLUDED);

        assert_eq!(metrics.get(REQUESTS_TOTAL), 2);
        assert_eq!(metrics.get(REQUESTS_EXCLUDED), 1);
        assert_eq!(metrics.get(REQUESTS_DISRUPTED), 0);
        assert!(metrics.get(REQUESTS_TOTAL) >= metrics.get(REQUESTS_EXCLUDED) + metrics.get(REQUESTS_DISRUPTED));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;

        let metrics = Arc::new(MetricMap::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    metrics.increment(REQUESTS_TOTAL);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.get(REQUESTS_TOTAL), 8000);
    }
}
