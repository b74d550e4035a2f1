use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only counters exposed by the feed client.
///
/// Incremented by the supervisor and decoder, read by health probes. Relaxed
/// ordering is sufficient - the counters are monotonic and independently read.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    frames_received: AtomicU64,
    ticks_decoded: AtomicU64,
    decode_errors: AtomicU64,
    connection_generation: AtomicU64,
}

impl FeedMetrics {
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks_decoded(&self, count: u64) {
        self.ticks_decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Incremented on every successful broker authentication.
    pub fn next_generation(&self) -> u64 {
        self.connection_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_generation(&self) -> u64 {
        self.connection_generation.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            ticks_decoded: self.ticks_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            connection_generation: self.connection_generation.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FeedMetrics`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct FeedMetricsSnapshot {
    pub frames_received: u64,
    pub ticks_decoded: u64,
    pub decode_errors: u64,
    pub connection_generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = FeedMetrics::default();
        metrics.frame_received();
        metrics.frame_received();
        metrics.ticks_decoded(5);
        assert_eq!(metrics.next_generation(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.ticks_decoded, 5);
        assert_eq!(snapshot.decode_errors, 0);
        assert_eq!(snapshot.connection_generation, 1);
    }
}
