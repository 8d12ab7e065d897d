//! Send workers.
//!
//! A worker owns one send primitive and runs the [`burst::BurstLoop`] for
//! its share of the session rate. Two variants implement the same [`Worker`]
//! contract:
//!
//! * [`thread::ThreadWorker`] runs the loop on an OS thread in this process.
//! * [`process::ProcessWorker`] runs it in a child process (one raw socket
//!   and privilege context per process) and streams counters back over the
//!   child's stdout.
//!
//! Both observe the session's [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and both are joined against a deadline, by which they are forced.

pub mod burst;
pub mod clock;
pub mod process;
pub mod protocol;
pub mod sink;
pub mod thread;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::WorkerMode;
use crate::packet::Protocol;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The send primitive could not be acquired (socket creation, privilege).
    #[error("worker {worker_id}: send primitive unavailable: {reason}")]
    Resource { worker_id: usize, reason: String },

    /// A process worker could not be launched.
    #[error("worker {worker_id}: failed to spawn worker process: {reason}")]
    Spawn { worker_id: usize, reason: String },
}

/// Everything a worker needs to know about its slice of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: usize,
    pub protocol: Protocol,
    pub destination: Ipv4Addr,
    pub target_port: u16,
    /// Local address for hand-built IP headers (TCP SYN only).
    pub source: Ipv4Addr,
    /// This worker's share of the session target, bytes per second.
    pub rate_bytes_per_sec: u64,
    pub packet_size: usize,
}

impl WorkerSpec {
    /// Time budget per packet at this worker's share of the rate.
    pub fn packet_interval(&self) -> Duration {
        if self.rate_bytes_per_sec == 0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(self.packet_size as f64 / self.rate_bytes_per_sec as f64)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited cooperatively after cancellation.
    Finished { packets: u64, drops: u64 },
    /// Exited on its own because of an error.
    Failed { reason: String },
    /// Did not exit within the grace period and was killed.
    Killed,
    /// Thread did not exit within the grace period; it has been detached and
    /// will exit at its next cancellation check.
    Abandoned,
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Finished { .. })
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Finished { packets, drops } => {
                write!(f, "finished ({} packets, {} dropped)", packets, drops)
            }
            WorkerExit::Failed { reason } => write!(f, "failed: {}", reason),
            WorkerExit::Killed => write!(f, "killed after grace period"),
            WorkerExit::Abandoned => write!(f, "abandoned after grace period"),
        }
    }
}

/// Start/cancel/join contract shared by thread and process workers.
#[async_trait::async_trait]
pub trait Worker: Send {
    fn id(&self) -> usize;

    fn mode(&self) -> WorkerMode;

    /// Ask the worker to stop. Workers also watch the session token; this
    /// covers variant-specific signalling (closing a child's stdin).
    fn cancel(&mut self);

    /// Wait for a cooperative exit, forcing it so that the call returns by
    /// `deadline`.
    async fn join(&mut self, deadline: Instant) -> WorkerExit;
}
