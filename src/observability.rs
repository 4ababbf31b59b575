use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Per-session counters for the consistency core
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub exhausted: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub resyncs: AtomicU64,
    pub events_queued: AtomicU64,
    pub events_sent: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_evicted: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.events_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, count: usize) {
        self.events_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.events_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.events_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_evicted: self.events_evicted.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            requests = stats.requests,
            retries = stats.retries,
            timeouts = stats.timeouts,
            exhausted = stats.exhausted,
            duplicates_dropped = stats.duplicates_dropped,
            resyncs = stats.resyncs,
            events_queued = stats.events_queued,
            events_sent = stats.events_sent,
            events_dropped = stats.events_dropped,
            events_evicted = stats.events_evicted,
            "Sync core metrics"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub requests: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub exhausted: u64,
    pub duplicates_dropped: u64,
    pub resyncs: u64,
    pub events_queued: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub events_evicted: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SyncMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_retry();
        metrics.record_sent(5);
        metrics.record_dropped(2);

        let stats = metrics.snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.events_sent, 5);
        assert_eq!(stats.events_dropped, 2);
        assert_eq!(stats.timeouts, 0);
    }
}
