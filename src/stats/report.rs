//! Periodic snapshot delivery and human-readable formatting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Aggregator, SnapshotSink, StatisticsSnapshot};

/// Start the reporting task for a session.
///
/// Emits `aggregator.sample()` to `sink` once per `period` until `cancel`
/// fires. Ticks that fall behind are delayed rather than bunched, so two
/// emissions are never closer than `period`.
pub fn spawn_reporter(
    aggregator: Arc<Aggregator>,
    sink: Arc<dyn SnapshotSink>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing to report yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("reporter stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = aggregator.sample(Instant::now());
                    sink.on_snapshot(&snapshot);
                }
            }
        }
    })
}

/// Format a rate given in bytes per second with Mbps/Gbps scaling.
pub fn format_rate(bytes_per_sec: f64) -> String {
    let mbps = bytes_per_sec * 8.0 / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One-line summary of a snapshot.
pub fn format_summary(snapshot: &StatisticsSnapshot) -> String {
    let mut summary = format!(
        "{} of {} target ({}), {} packets, {:.2} MB in {:.0}s, {} worker{}",
        format_rate(snapshot.current_rate_bytes_per_sec),
        format_rate(snapshot.target_rate_bytes_per_sec as f64),
        snapshot.performance,
        snapshot.total_packets,
        snapshot.total_megabytes(),
        snapshot.elapsed.as_secs_f64(),
        snapshot.active_workers,
        if snapshot.active_workers == 1 { "" } else { "s" },
    );

    if snapshot.drops > 0 {
        summary.push_str(&format!(", {} dropped", snapshot.drops));
    }

    summary
}
