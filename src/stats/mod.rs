//! Send statistics: aggregation, snapshots, and the reporting sink.

pub mod aggregator;
pub mod report;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub use aggregator::Aggregator;

/// How the measured rate compares to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Performance {
    BelowTarget,
    OnTarget,
    ExceedingTarget,
}

impl Performance {
    /// Below 80% of target is `BelowTarget`, above 120% is `ExceedingTarget`.
    pub fn classify(current: f64, target: f64) -> Self {
        if current < target * 0.8 {
            Performance::BelowTarget
        } else if current > target * 1.2 {
            Performance::ExceedingTarget
        } else {
            Performance::OnTarget
        }
    }
}

impl fmt::Display for Performance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Performance::BelowTarget => write!(f, "BELOW TARGET"),
            Performance::OnTarget => write!(f, "ON TARGET"),
            Performance::ExceedingTarget => write!(f, "EXCEEDING TARGET"),
        }
    }
}

/// Immutable point-in-time view of a session's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    /// Sends rejected by the send primitive.
    pub drops: u64,
    /// Bytes per second over the most recent reporting window.
    pub current_rate_bytes_per_sec: f64,
    pub target_rate_bytes_per_sec: u64,
    pub elapsed: Duration,
    pub active_workers: usize,
    pub performance: Performance,
    pub taken_at: DateTime<Utc>,
}

impl StatisticsSnapshot {
    pub fn current_mbps(&self) -> f64 {
        self.current_rate_bytes_per_sec * 8.0 / 1_000_000.0
    }

    pub fn target_mbps(&self) -> f64 {
        self.target_rate_bytes_per_sec as f64 * 8.0 / 1_000_000.0
    }

    pub fn total_megabytes(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Average rate since the session started, in bytes per second.
    pub fn average_rate_bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Receiver of periodic snapshots (live display, log writer, ...).
///
/// Called from the session's reporting task; implementations must not block
/// for long.
pub trait SnapshotSink: Send + Sync {
    fn on_snapshot(&self, snapshot: &StatisticsSnapshot);

    /// Final snapshot after all workers have stopped.
    fn on_stop(&self, snapshot: &StatisticsSnapshot) {
        self.on_snapshot(snapshot);
    }
}

impl<F> SnapshotSink for F
where
    F: Fn(&StatisticsSnapshot) + Send + Sync,
{
    fn on_snapshot(&self, snapshot: &StatisticsSnapshot) {
        self(snapshot)
    }
}

/// Default sink: one structured `tracing` event per snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SnapshotSink for TracingSink {
    fn on_snapshot(&self, s: &StatisticsSnapshot) {
        info!(
            packets = s.total_packets,
            bytes = s.total_bytes,
            drops = s.drops,
            current_mbps = s.current_mbps(),
            target_mbps = s.target_mbps(),
            active_workers = s.active_workers,
            elapsed_sec = s.elapsed.as_secs(),
            performance = %s.performance,
            "flood progress"
        );
    }

    fn on_stop(&self, s: &StatisticsSnapshot) {
        info!(
            packets = s.total_packets,
            total_mb = s.total_megabytes(),
            drops = s.drops,
            average_mbps = s.average_rate_bytes_per_sec() * 8.0 / 1_000_000.0,
            duration_sec = s.elapsed.as_secs(),
            "flood stopped"
        );
    }
}
