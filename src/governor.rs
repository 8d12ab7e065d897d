//! Burst-size feedback control.
//!
//! Every worker owns one [`RateGovernor`]. After each burst it reports how
//! many packets went out; once a measurement window of at least
//! `min_interval` has elapsed the governor compares the achieved bit rate
//! with the worker's share of the target and doubles or halves the burst
//! size. A dead band around the target keeps the burst from oscillating.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::GovernorConfig;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("invalid governor configuration: {0}")]
    InvalidConfig(String),
}

impl GovernorConfig {
    /// Check the invariants the governor relies on.
    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.min_burst == 0 {
            return Err(GovernorError::InvalidConfig("min_burst must be at least 1".into()));
        }
        if self.min_burst > self.max_burst {
            return Err(GovernorError::InvalidConfig(format!(
                "min_burst ({}) exceeds max_burst ({})",
                self.min_burst, self.max_burst
            )));
        }
        if self.initial_burst < self.min_burst || self.initial_burst > self.max_burst {
            return Err(GovernorError::InvalidConfig(format!(
                "initial_burst ({}) outside [{}, {}]",
                self.initial_burst, self.min_burst, self.max_burst
            )));
        }
        if self.min_interval_ms == 0 {
            return Err(GovernorError::InvalidConfig("min_interval_ms must be positive".into()));
        }
        if !(self.lower_ratio > 0.0 && self.lower_ratio < 1.0 && self.upper_ratio > 1.0) {
            return Err(GovernorError::InvalidConfig(format!(
                "tolerance band [{}, {}] must satisfy 0 < lower < 1 < upper",
                self.lower_ratio, self.upper_ratio
            )));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Clamp `burst` into `[min_burst, max_burst]`.
    pub fn clamp(&self, burst: u32) -> u32 {
        burst.clamp(self.min_burst.max(1), self.max_burst.max(self.min_burst.max(1)))
    }
}

/// Pure burst-size decision for one measurement window.
///
/// Returns `None` when the window is shorter than `config.min_interval_ms`,
/// in which case the caller keeps accumulating. Otherwise returns the burst
/// size for the next window, always inside the configured bounds.
pub fn adjust_burst(
    packets: u64,
    elapsed: Duration,
    packet_size: usize,
    target_bits_per_sec: f64,
    current_burst: u32,
    config: &GovernorConfig,
) -> Option<u32> {
    if elapsed < config.min_interval() {
        return None;
    }
    let current = config.clamp(current_burst);
    if target_bits_per_sec <= 0.0 {
        return Some(current);
    }

    let achieved = achieved_bits_per_sec(packets, elapsed, packet_size);
    let next = if achieved < target_bits_per_sec * config.lower_ratio {
        current.saturating_mul(2)
    } else if achieved > target_bits_per_sec * config.upper_ratio {
        current / 2
    } else {
        current
    };

    Some(config.clamp(next))
}

/// `packets * packet_size * 8 / elapsed_secs`.
pub fn achieved_bits_per_sec(packets: u64, elapsed: Duration, packet_size: usize) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    packets as f64 * packet_size as f64 * 8.0 / secs
}

/// Per-worker governor state. Not shared between threads.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    config: GovernorConfig,
    burst: u32,
    packet_size: usize,
    target_bits_per_sec: f64,
    interval_packets: u64,
    interval_start: Instant,
    last_achieved: Option<f64>,
}

impl RateGovernor {
    /// `target_bytes_per_sec` is this worker's share; the conversion to bits
    /// happens here and nowhere else.
    pub fn new(config: GovernorConfig, packet_size: usize, target_bytes_per_sec: u64, now: Instant) -> Self {
        let burst = config.clamp(config.initial_burst);
        Self {
            config,
            burst,
            packet_size,
            target_bits_per_sec: target_bytes_per_sec as f64 * 8.0,
            interval_packets: 0,
            interval_start: now,
            last_achieved: None,
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn target_bits_per_sec(&self) -> f64 {
        self.target_bits_per_sec
    }

    /// Achieved rate of the most recent closed window.
    pub fn last_achieved_bits_per_sec(&self) -> Option<f64> {
        self.last_achieved
    }

    /// Count packets sent in the current window.
    pub fn record(&mut self, packets: u64) {
        self.interval_packets += packets;
    }

    /// Close the window if it is long enough and return the (possibly
    /// unchanged) burst size for the next one.
    pub fn observe(&mut self, now: Instant) -> Option<u32> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        let next = adjust_burst(
            self.interval_packets,
            elapsed,
            self.packet_size,
            self.target_bits_per_sec,
            self.burst,
            &self.config,
        )?;

        self.last_achieved = Some(achieved_bits_per_sec(
            self.interval_packets,
            elapsed,
            self.packet_size,
        ));
        self.burst = next;
        self.interval_packets = 0;
        self.interval_start = now;
        Some(next)
    }
}
