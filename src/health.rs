//! Health accounting (§4.K, §6): the five counters the orchestrator
//! maintains plus the derived stream-staleness and LLM success-rate
//! figures the out-of-scope `/api/health` handler reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

/// A detached snapshot of the health counters, suitable for serializing
/// to the (out-of-scope) `/api/health` HTTP handler.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub posts_received: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub topics_extracted: u64,
    pub snapshot_writes: u64,
    pub stream_stale: bool,
    pub llm_success_rate: f64,
}

/// Guarded by atomics rather than a single mutex: each counter is
/// independent and the only derived reads (`llm_success_rate`,
/// `stream_stale`) tolerate the benign races of reading several atomics
/// that were not updated in the same instant.
pub struct HealthMonitor {
    posts_received: AtomicU64,
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    topics_extracted: AtomicU64,
    snapshot_writes: AtomicU64,
    last_post_at_epoch_ms: AtomicI64,
    stale_stream_seconds: u64,
}

impl HealthMonitor {
    pub fn new(stale_stream_seconds: u64) -> Self {
        Self {
            posts_received: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            topics_extracted: AtomicU64::new(0),
            snapshot_writes: AtomicU64::new(0),
            last_post_at_epoch_ms: AtomicI64::new(0),
            stale_stream_seconds,
        }
    }

    pub fn post_received(&self) {
        self.posts_received.fetch_add(1, Ordering::Relaxed);
        self.last_post_at_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn batch_success(&self, topic_count: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.topics_extracted
            .fetch_add(topic_count as u64, Ordering::Relaxed);
    }

    pub fn batch_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_written(&self) {
        self.snapshot_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// A copy of all counters plus the derived figures, safe to log or
    /// serve without holding any lock.
    pub fn snapshot(&self) -> HealthSnapshot {
        let processed = self.batches_processed.load(Ordering::Relaxed);
        let failed = self.batches_failed.load(Ordering::Relaxed);
        let llm_success_rate = if processed + failed == 0 {
            1.0
        } else {
            processed as f64 / (processed + failed) as f64
        };

        let last_post_ms = self.last_post_at_epoch_ms.load(Ordering::Relaxed);
        let stream_stale = if last_post_ms == 0 {
            false
        } else {
            let age_ms = Utc::now().timestamp_millis() - last_post_ms;
            age_ms > (self.stale_stream_seconds as i64) * 1000
        };

        HealthSnapshot {
            posts_received: self.posts_received.load(Ordering::Relaxed),
            batches_processed: processed,
            batches_failed: failed,
            topics_extracted: self.topics_extracted.load(Ordering::Relaxed),
            snapshot_writes: self.snapshot_writes.load(Ordering::Relaxed),
            stream_stale,
            llm_success_rate,
        }
    }

    /// Emit the periodic health-log line (§4.K step 4's timer body).
    pub fn log_health(&self) {
        let s = self.snapshot();
        tracing::info!(
            posts_received = s.posts_received,
            batches_processed = s.batches_processed,
            batches_failed = s.batches_failed,
            topics_extracted = s.topics_extracted,
            snapshot_writes = s.snapshot_writes,
            stream_stale = s.stream_stale,
            llm_success_rate = s.llm_success_rate,
            "health"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_one_when_no_batches_seen() {
        let monitor = HealthMonitor::new(1800);
        assert_eq!(monitor.snapshot().llm_success_rate, 1.0);
    }

    #[test]
    fn success_rate_reflects_failures() {
        let monitor = HealthMonitor::new(1800);
        monitor.batch_success(3);
        monitor.batch_success(0);
        monitor.batch_failure();
        let snap = monitor.snapshot();
        assert_eq!(snap.batches_processed, 2);
        assert_eq!(snap.batches_failed, 1);
        assert!((snap.llm_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.topics_extracted, 3);
    }

    #[test]
    fn stream_is_not_stale_before_any_post_received() {
        let monitor = HealthMonitor::new(1);
        assert!(!monitor.snapshot().stream_stale);
    }

    #[test]
    fn stream_is_stale_after_threshold_with_no_new_posts() {
        let monitor = HealthMonitor::new(0);
        monitor.post_received();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(monitor.snapshot().stream_stale);
    }
}
