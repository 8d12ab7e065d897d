//! Line protocol between the session and its worker processes.
//!
//! The parent passes a [`WorkerLaunch`] as a JSON argument. The child writes
//! one JSON [`WorkerMessage`] per line on stdout and stops when its stdin
//! reaches end of file.

use serde::{Deserialize, Serialize};

use super::WorkerSpec;
use crate::config::{GovernorConfig, TemplateConfig};

/// Everything a worker process needs to run its slice of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLaunch {
    pub spec: WorkerSpec,
    pub governor: GovernorConfig,
    pub template: TemplateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Send primitive acquired, loop running.
    Ready { worker_id: usize },
    /// Counts since the previous progress message.
    Progress { packets: u64, bytes: u64, drops: u64 },
    /// The worker could not start or stopped on an error.
    Failed { worker_id: usize, reason: String },
    /// Clean exit with cumulative totals.
    Finished { worker_id: usize, packets: u64, drops: u64 },
}

impl WorkerMessage {
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
