//! Write-rate counters and coordinator statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Values per second over a sliding window of one-second buckets.
///
/// The `*_at` methods take the current instant explicitly so the window can be
/// driven deterministically.
#[derive(Debug)]
pub struct RateCounter {
    origin: Instant,
    buckets: Mutex<Vec<Bucket>>,
    total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    second: u64,
    count: u64,
}

impl RateCounter {
    /// Creates a counter averaging over `window` (rounded down to whole
    /// seconds, minimum one).
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Creates a counter whose clock starts at `origin`.
    pub fn starting_at(window: Duration, origin: Instant) -> Self {
        let slots = usize::try_from(window.as_secs()).unwrap_or(usize::MAX).max(1);
        Self {
            origin,
            buckets: Mutex::new(vec![Bucket::default(); slots]),
            total: AtomicU64::new(0),
        }
    }

    /// Records `n` values now.
    pub fn add(&self, n: u64) {
        self.add_at(Instant::now(), n);
    }

    /// Records `n` values at `now`.
    pub fn add_at(&self, now: Instant, n: u64) {
        let second = self.second_of(now);
        let mut buckets = self.buckets.lock();
        let slots = buckets.len() as u64;
        #[allow(clippy::cast_possible_truncation)] // modulo a usize length
        let bucket = &mut buckets[(second % slots) as usize];
        if bucket.second != second {
            *bucket = Bucket { second, count: 0 };
        }
        bucket.count += n;
        drop(buckets);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Average values per second over the window ending now.
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    /// Average values per second over the window ending at `now`.
    #[allow(clippy::cast_precision_loss)] // counts far below 2^52
    pub fn rate_at(&self, now: Instant) -> f64 {
        let second = self.second_of(now);
        let buckets = self.buckets.lock();
        let slots = buckets.len() as u64;
        let oldest = second.saturating_sub(slots - 1);
        let sum: u64 = buckets
            .iter()
            .filter(|b| b.count > 0 && b.second >= oldest && b.second <= second)
            .map(|b| b.count)
            .sum();
        sum as f64 / slots as f64
    }

    /// Every value ever recorded.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }
}

/// Counters kept by the write coordinator.
#[derive(Debug)]
pub struct WriteMetrics {
    /// Values persisted through the synchronous path.
    pub sync_rate: RateCounter,
    /// Values accepted onto the asynchronous queues.
    pub async_rate: RateCounter,
    /// Values currently waiting in the queues.
    pub queued: AtomicU64,
    /// Values evicted by the overflow policy.
    pub discarded: AtomicU64,
    /// Values given up after every retry failed.
    pub dropped: AtomicU64,
    /// Batch retries performed.
    pub retries: AtomicU64,
    /// Synchronous writes that returned an error.
    pub failed_sync: AtomicU64,
}

impl WriteMetrics {
    /// Creates zeroed metrics with rate counters over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            sync_rate: RateCounter::new(window),
            async_rate: RateCounter::new(window),
            queued: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failed_sync: AtomicU64::new(0),
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> WriteMetricsSnapshot {
        WriteMetricsSnapshot {
            sync_rate: self.sync_rate.rate(),
            async_rate: self.async_rate.rate(),
            sync_total: self.sync_rate.total(),
            async_total: self.async_rate.total(),
            queued: self.queued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed_sync: self.failed_sync.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriteMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WriteMetricsSnapshot {
    /// Synchronous values per second.
    pub sync_rate: f64,
    /// Asynchronous values per second.
    pub async_rate: f64,
    /// Synchronous values ever written.
    pub sync_total: u64,
    /// Asynchronous values ever accepted.
    pub async_total: u64,
    /// Values waiting in the queues.
    pub queued: u64,
    /// Values evicted by the overflow policy.
    pub discarded: u64,
    /// Values dropped after exhausting retries.
    pub dropped: u64,
    /// Batch retries performed.
    pub retries: u64,
    /// Failed synchronous writes.
    pub failed_sync: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_averages_over_window() {
        let origin = Instant::now();
        let counter = RateCounter::starting_at(Duration::from_secs(4), origin);
        counter.add_at(origin, 4);
        counter.add_at(origin + Duration::from_millis(1500), 4);
        assert_eq!(counter.rate_at(origin + Duration::from_secs(1)), 2.0);
        assert_eq!(counter.total(), 8);
    }

    #[test]
    fn test_old_buckets_fall_out_of_window() {
        let origin = Instant::now();
        let counter = RateCounter::starting_at(Duration::from_secs(2), origin);
        counter.add_at(origin, 10);
        assert_eq!(counter.rate_at(origin + Duration::from_secs(1)), 5.0);
        assert_eq!(counter.rate_at(origin + Duration::from_secs(2)), 0.0);

        // Reusing the slot resets it.
        counter.add_at(origin + Duration::from_secs(2), 1);
        assert_eq!(counter.rate_at(origin + Duration::from_secs(2)), 0.5);
        assert_eq!(counter.total(), 11);
    }

    #[test]
    fn test_zero_window_uses_one_bucket() {
        let origin = Instant::now();
        let counter = RateCounter::starting_at(Duration::ZERO, origin);
        counter.add_at(origin, 3);
        assert_eq!(counter.rate_at(origin), 3.0);
    }

    #[test]
    fn test_metrics_snapshot_counters_independent() {
        let metrics = WriteMetrics::new(Duration::from_secs(10));
        metrics.sync_rate.add(5);
        metrics.async_rate.add(2);
        metrics.dropped.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.sync_total, 5);
        assert_eq!(snap.async_total, 2);
        assert_eq!(snap.dropped, 1);
        assert!(snap.sync_rate > snap.async_rate);
    }
}
