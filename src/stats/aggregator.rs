//! Lock-free counter aggregation shared by all workers of a session.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{Performance, StatisticsSnapshot};

/// Pull requests that land less than this after the last reporting sample
/// reuse the previous window's rate instead of dividing by a tiny interval.
pub const MIN_RATE_WINDOW: Duration = Duration::from_millis(100);

/// Session-wide send counters.
///
/// Workers only ever `fetch_add` into the counters, so totals are monotonic
/// and no update is lost. The rate window is touched only by readers.
#[derive(Debug)]
pub struct Aggregator {
    packets: AtomicU64,
    bytes: AtomicU64,
    drops: AtomicU64,
    active_workers: AtomicUsize,
    target_rate: u64,
    started_at: Instant,
    window: Mutex<RateWindow>,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    start: Instant,
    bytes_at_start: u64,
    last_rate: f64,
}

impl Aggregator {
    pub fn new(target_rate_bytes_per_sec: u64) -> Self {
        Self::starting_at(target_rate_bytes_per_sec, Instant::now())
    }

    pub fn starting_at(target_rate_bytes_per_sec: u64, started_at: Instant) -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            target_rate: target_rate_bytes_per_sec,
            started_at,
            window: Mutex::new(RateWindow {
                start: started_at,
                bytes_at_start: 0,
                last_rate: 0.0,
            }),
        }
    }

    #[inline]
    pub fn record_sent(&self, packets: u64, bytes: u64) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drops(&self, drops: u64) {
        self.drops.fetch_add(drops, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn worker_finished(&self) {
        // Never wraps below zero even if a worker reports twice.
        let _ = self
            .active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn total_packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn total_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub fn target_rate(&self) -> u64 {
        self.target_rate
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Point-in-time snapshot without moving the rate window.
    pub fn snapshot(&self, now: Instant) -> StatisticsSnapshot {
        let window = *self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = self.total_bytes();
        let rate = window_rate(&window, bytes, now).unwrap_or(window.last_rate);
        self.build(now, bytes, rate)
    }

    /// Snapshot for the reporting path: closes the current rate window so the
    /// next sample measures only what happened after this one.
    pub fn sample(&self, now: Instant) -> StatisticsSnapshot {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = self.total_bytes();
        let rate = match window_rate(&window, bytes, now) {
            Some(rate) => {
                *window = RateWindow {
                    start: now,
                    bytes_at_start: bytes,
                    last_rate: rate,
                };
                rate
            }
            None => window.last_rate,
        };
        drop(window);
        self.build(now, bytes, rate)
    }

    fn build(&self, now: Instant, bytes: u64, rate: f64) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_packets: self.total_packets(),
            total_bytes: bytes,
            drops: self.total_drops(),
            current_rate_bytes_per_sec: rate,
            target_rate_bytes_per_sec: self.target_rate,
            elapsed: now.saturating_duration_since(self.started_at),
            active_workers: self.active_workers(),
            performance: Performance::classify(rate, self.target_rate as f64),
            taken_at: Utc::now(),
        }
    }
}

fn window_rate(window: &RateWindow, bytes: u64, now: Instant) -> Option<f64> {
    let elapsed = now.saturating_duration_since(window.start);
    if elapsed < MIN_RATE_WINDOW {
        return None;
    }
    let delta = bytes.saturating_sub(window.bytes_at_start);
    Some(delta as f64 / elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        const WORKERS: u64 = 8;
        const PER_WORKER: u64 = 100_000;

        let agg = Arc::new(Aggregator::new(1_000_000));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let agg = agg.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    let now = agg.total_packets();
                    assert!(now >= last, "total went backwards: {} -> {}", last, now);
                    last = now;
                    reads += 1;
                    let _ = agg.snapshot(Instant::now());
                }
                reads
            })
        };

        let writers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_WORKER {
                        agg.record_sent(1, 100);
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);

        assert_eq!(agg.total_packets(), WORKERS * PER_WORKER);
        assert_eq!(agg.total_bytes(), WORKERS * PER_WORKER * 100);
    }

    #[test]
    fn test_rate_uses_most_recent_window() {
        let start = Instant::now();
        let agg = Aggregator::starting_at(1000, start);

        // First second: 10x the target.
        agg.record_sent(10, 10_000);
        let first = agg.sample(start + Duration::from_secs(1));
        assert!((first.current_rate_bytes_per_sec - 10_000.0).abs() < 1e-6);
        assert_eq!(first.performance, Performance::ExceedingTarget);

        // Second second: exactly on target; the earlier burst must not leak in.
        agg.record_sent(1, 1000);
        let second = agg.sample(start + Duration::from_secs(2));
        assert!((second.current_rate_bytes_per_sec - 1000.0).abs() < 1e-6);
        assert_eq!(second.performance, Performance::OnTarget);
        assert_eq!(second.total_bytes, 11_000);
        assert_eq!(second.elapsed, Duration::from_secs(2));
    }

    #[test]
    fn test_short_pull_reuses_last_rate() {
        let start = Instant::now();
        let agg = Aggregator::starting_at(1000, start);
        agg.record_sent(1, 500);
        agg.sample(start + Duration::from_secs(1));

        agg.record_sent(1, 500);
        let pulled = agg.snapshot(start + Duration::from_millis(1010));
        assert!((pulled.current_rate_bytes_per_sec - 500.0).abs() < 1e-6);
        assert_eq!(pulled.total_bytes, 1000);
    }

    #[test]
    fn test_snapshot_does_not_move_window() {
        let start = Instant::now();
        let agg = Aggregator::starting_at(1000, start);
        agg.record_sent(1, 2000);
        let pulled = agg.snapshot(start + Duration::from_secs(1));
        let sampled = agg.sample(start + Duration::from_secs(2));
        assert!((pulled.current_rate_bytes_per_sec - 2000.0).abs() < 1e-6);
        assert!((sampled.current_rate_bytes_per_sec - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_active_worker_gauge() {
        let agg = Aggregator::new(1);
        agg.worker_started();
        agg.worker_started();
        agg.worker_finished();
        assert_eq!(agg.active_workers(), 1);
        agg.worker_finished();
        agg.worker_finished();
        assert_eq!(agg.active_workers(), 0);
    }

    #[test]
    fn test_drops_counted_separately() {
        let agg = Aggregator::new(1);
        agg.record_sent(3, 300);
        agg.record_drops(2);
        let snap = agg.snapshot(Instant::now());
        assert_eq!(snap.total_packets, 3);
        assert_eq!(snap.drops, 2);
    }
}
