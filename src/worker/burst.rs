//! The per-worker send loop.
//!
//! Each cycle closes the governor window, sends `burst` packets back to back,
//! then sleeps off whatever is left of the time those packets are worth at
//! the worker's share of the rate. Pacing is relative to the start of the
//! cycle, so every wake-up costs the cycle its scheduling latency: small
//! bursts fall short of the target and the governor grows the burst until the
//! overhead is amortised. A cycle never covers more than one second of
//! packets, so low rates are not front-loaded. The token is checked before
//! every packet, so a cancelled worker stops within one send call no matter
//! how large the burst has grown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::sink::PacketSink;
use super::WorkerSpec;
use crate::config::GovernorConfig;
use crate::governor::RateGovernor;
use crate::packet::PoolCursor;
use crate::stats::Aggregator;

/// Local counts are pushed to the aggregator at least this often.
pub const FLUSH_EVERY: u64 = 1024;

/// Longest single sleep, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Upper bound on the schedule one cycle may cover.
const MAX_CYCLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstTotals {
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
}

impl BurstTotals {
    fn attempted(&self) -> u64 {
        self.packets + self.drops
    }

    fn absorb(&mut self, other: &BurstTotals) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.drops += other.drops;
    }
}

#[derive(Debug, Clone)]
pub struct BurstOutcome {
    pub totals: BurstTotals,
    pub final_burst: u32,
    /// Rate measured in the last closed governor window.
    pub last_achieved_bits_per_sec: Option<f64>,
}

pub struct BurstLoop<S, C> {
    worker_id: usize,
    sink: S,
    clock: C,
    cursor: PoolCursor,
    governor: RateGovernor,
    packet_interval_secs: f64,
    /// Packets worth `MAX_CYCLE` at this worker's rate.
    max_chunk: u32,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
}

impl<S: PacketSink, C: Clock> BurstLoop<S, C> {
    pub fn new(
        spec: &WorkerSpec,
        sink: S,
        clock: C,
        cursor: PoolCursor,
        governor: GovernorConfig,
        aggregator: Arc<Aggregator>,
        cancel: CancellationToken,
    ) -> Self {
        let governor = RateGovernor::new(
            governor,
            spec.packet_size,
            spec.rate_bytes_per_sec,
            clock.now(),
        );
        let packet_interval_secs = if spec.rate_bytes_per_sec == 0 {
            f64::INFINITY
        } else {
            spec.packet_size as f64 / spec.rate_bytes_per_sec as f64
        };
        let max_chunk = if packet_interval_secs.is_finite() {
            (MAX_CYCLE.as_secs_f64() / packet_interval_secs)
                .ceil()
                .clamp(1.0, u32::MAX as f64) as u32
        } else {
            1
        };

        Self {
            worker_id: spec.id,
            sink,
            clock,
            cursor,
            governor,
            packet_interval_secs,
            max_chunk,
            aggregator,
            cancel,
        }
    }

    /// Run until cancelled.
    pub fn run(mut self) -> BurstOutcome {
        let mut totals = BurstTotals::default();

        debug!(
            worker_id = self.worker_id,
            burst = self.governor.burst(),
            target_mbps = self.governor.target_bits_per_sec() / 1_000_000.0,
            "burst loop started"
        );

        if !self.packet_interval_secs.is_finite() {
            // Zero share: nothing to send, just wait to be stopped.
            self.sleep_until(None);
        }

        while !self.cancel.is_cancelled() {
            let cycle_start = self.clock.now();

            let previous = self.governor.burst();
            if let Some(next) = self.governor.observe(cycle_start) {
                if next != previous {
                    debug!(
                        worker_id = self.worker_id,
                        from = previous,
                        to = next,
                        achieved_mbps = self.governor.last_achieved_bits_per_sec().unwrap_or(0.0)
                            / 1_000_000.0,
                        "burst size adjusted"
                    );
                }
            }

            let chunk = self.governor.burst().min(self.max_chunk);
            let burst = self.send_burst(chunk, &mut totals);
            self.governor.record(burst.packets);

            let due = self.due(cycle_start, burst.attempted());
            if due.is_some_and(|due| self.clock.now() >= due) {
                trace!(worker_id = self.worker_id, "burst overran its time budget");
            }
            if !self.sleep_until(due) {
                break;
            }
        }

        debug!(
            worker_id = self.worker_id,
            packets = totals.packets,
            drops = totals.drops,
            final_burst = self.governor.burst(),
            "burst loop finished"
        );

        BurstOutcome {
            totals,
            final_burst: self.governor.burst(),
            last_achieved_bits_per_sec: self.governor.last_achieved_bits_per_sec(),
        }
    }

    /// Send up to `burst` packets, stopping early on cancellation.
    fn send_burst(&mut self, burst: u32, totals: &mut BurstTotals) -> BurstTotals {
        let mut this_burst = BurstTotals::default();
        let mut pending = BurstTotals::default();

        for _ in 0..burst {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.sink.send(self.cursor.next_packet()) {
                Ok(n) => {
                    pending.packets += 1;
                    pending.bytes += n as u64;
                }
                Err(e) => {
                    if totals.drops + this_burst.drops + pending.drops == 0 {
                        warn!(worker_id = self.worker_id, error = %e, "send failed, counting as drop");
                    }
                    pending.drops += 1;
                }
            }

            if pending.attempted() >= FLUSH_EVERY {
                self.flush(&mut pending, &mut this_burst);
            }
        }

        self.flush(&mut pending, &mut this_burst);
        totals.absorb(&this_burst);
        this_burst
    }

    fn flush(&self, pending: &mut BurstTotals, into: &mut BurstTotals) {
        if pending.attempted() == 0 {
            return;
        }
        self.aggregator.record_sent(pending.packets, pending.bytes);
        if pending.drops > 0 {
            self.aggregator.record_drops(pending.drops);
        }
        into.absorb(pending);
        *pending = BurstTotals::default();
    }

    /// End of the time budget for `attempted` packets sent from `start`.
    /// `None` when it lies beyond any representable instant (zero rate).
    fn due(&self, start: Instant, attempted: u64) -> Option<Instant> {
        let offset = Duration::try_from_secs_f64(self.packet_interval_secs * attempted as f64)
            .ok()?;
        start.checked_add(offset)
    }

    /// Sleep in slices until `due`. Returns `false` if cancelled first.
    fn sleep_until(&self, due: Option<Instant>) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = self.clock.now();
            let remaining = match due {
                Some(due) if now >= due => return true,
                Some(due) => due - now,
                None => SLEEP_SLICE,
            };
            self.clock.sleep(remaining.min(SLEEP_SLICE));
        }
    }
}
