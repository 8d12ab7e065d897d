//! Flood session: one worker set, its aggregator and its reporting task.
//!
//! A [`Session`] moves `Idle -> Starting -> Running -> Stopping -> Idle`.
//! Starting while running stops the current worker set first, so at most one
//! set ever sends on behalf of a session. Every run gets a fresh
//! cancellation token; stopping cancels it, joins the workers within the
//! configured grace period and delivers the final snapshot.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{StressConfig, WorkerMode};
use crate::governor::GovernorError;
use crate::packet::{resolve_target, PacketError, Protocol, TemplatePool};
use crate::stats::report::spawn_reporter;
use crate::stats::{Aggregator, SnapshotSink, StatisticsSnapshot};
use crate::worker::process::{ProcessLauncher, ProcessWorker};
use crate::worker::protocol::WorkerLaunch;
use crate::worker::sink::local_source_address;
use crate::worker::thread::ThreadWorker;
use crate::worker::{Worker, WorkerError, WorkerExit, WorkerSpec};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid flood configuration: {0}")]
    Configuration(String),

    #[error("could not resolve target address '{address}': {reason}")]
    AddressResolution { address: String, reason: String },

    /// Every worker failed to acquire its send primitive.
    #[error("no worker could start: {0}")]
    NoWorkers(String),
}

impl From<PacketError> for SessionError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::AddressResolution { address, reason } => {
                SessionError::AddressResolution { address, reason }
            }
            PacketError::InvalidConfiguration(msg) => SessionError::Configuration(msg),
        }
    }
}

impl From<GovernorError> for SessionError {
    fn from(e: GovernorError) -> Self {
        SessionError::Configuration(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Flood configuration
// ---------------------------------------------------------------------------

/// What to send, where, and how fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    pub protocol: Protocol,
    /// IPv4 literal or host name.
    pub target_address: String,
    /// Destination port; ignored for ICMP.
    #[serde(default)]
    pub target_port: u16,
    /// Session-wide target in bytes per second.
    pub target_rate_bytes_per_sec: u64,
    /// Worker count; `None` uses the engine default.
    #[serde(default)]
    pub parallelism: Option<usize>,
    /// Bytes per packet; `None` uses the protocol default.
    #[serde(default)]
    pub packet_size: Option<usize>,
}

impl FloodConfig {
    pub fn new(protocol: Protocol, target_address: impl Into<String>, rate_bytes_per_sec: u64) -> Self {
        Self {
            protocol,
            target_address: target_address.into(),
            target_port: 0,
            target_rate_bytes_per_sec: rate_bytes_per_sec,
            parallelism: None,
            packet_size: None,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
            .unwrap_or_else(|| self.protocol.default_packet_size())
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.target_address.trim().is_empty() {
            return Err(SessionError::Configuration("target address is empty".into()));
        }
        if self.target_rate_bytes_per_sec == 0 {
            return Err(SessionError::Configuration("target rate must be positive".into()));
        }
        if self.parallelism == Some(0) {
            return Err(SessionError::Configuration("parallelism must be at least 1".into()));
        }
        if self.protocol.uses_port() && self.target_port == 0 {
            return Err(SessionError::Configuration(format!(
                "{} requires a non-zero target port",
                self.protocol
            )));
        }
        let size = self.packet_size();
        let (min, max) = (self.protocol.min_packet_size(), self.protocol.max_packet_size());
        if size < min || size > max {
            return Err(SessionError::Configuration(format!(
                "{} packet size {} outside {}..={}",
                self.protocol, size, min, max
            )));
        }
        Ok(())
    }
}

/// Split `total` bytes/sec across `workers`; the remainder goes to worker 0
/// so the shares always sum to `total`.
pub fn split_rate(total: u64, workers: usize) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let n = workers as u64;
    let mut shares = vec![total / n; workers];
    shares[0] += total % n;
    shares
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Identity of one started run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub protocol: Protocol,
    pub target: Ipv4Addr,
    pub target_port: u16,
    pub target_rate_bytes_per_sec: u64,
    pub packet_size: usize,
    /// Workers that actually started.
    pub workers: usize,
}

/// Outcome of a stopped run.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub handle: SessionHandle,
    /// `(worker id, exit)` sorted by id.
    pub exits: Vec<(usize, WorkerExit)>,
    pub final_snapshot: StatisticsSnapshot,
}

impl StopReport {
    /// Workers that exited cooperatively.
    pub fn clean_exits(&self) -> usize {
        self.exits.iter().filter(|(_, exit)| exit.is_clean()).count()
    }

    /// Workers that had to be killed or abandoned.
    pub fn forced_exits(&self) -> usize {
        self.exits
            .iter()
            .filter(|(_, exit)| matches!(exit, WorkerExit::Killed | WorkerExit::Abandoned))
            .count()
    }
}

struct ActiveRun {
    handle: SessionHandle,
    aggregator: Arc<Aggregator>,
    workers: Vec<Box<dyn Worker>>,
    reporter: JoinHandle<()>,
}

pub struct Session {
    config: StressConfig,
    sink: Arc<dyn SnapshotSink>,
    state: SessionState,
    cancel: CancellationToken,
    active: Option<ActiveRun>,
    last_report: Option<StopReport>,
}

impl Session {
    pub fn new(config: StressConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            config,
            sink,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            active: None,
            last_report: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.active.as_ref().map(|run| &run.handle)
    }

    /// Report of the most recently stopped run.
    pub fn last_report(&self) -> Option<&StopReport> {
        self.last_report.as_ref()
    }

    /// Workers currently sending for this session.
    pub fn active_workers(&self) -> usize {
        self.active
            .as_ref()
            .map(|run| run.aggregator.active_workers())
            .unwrap_or(0)
    }

    /// Pull a snapshot without disturbing the reporting cadence.
    pub fn snapshot(&self) -> Option<StatisticsSnapshot> {
        self.active
            .as_ref()
            .map(|run| run.aggregator.snapshot(Instant::now()))
    }

    /// Replace the cancellation token with a fresh one.
    ///
    /// Refused (returns `false`) while a worker set is running, since that
    /// would orphan the running workers from `stop`.
    pub fn reset(&mut self) -> bool {
        if self.active.is_some() {
            warn!(state = %self.state, "reset ignored while session is running");
            return false;
        }
        self.cancel = CancellationToken::new();
        true
    }

    /// Start sending. A running worker set is stopped first.
    pub async fn start(&mut self, flood: FloodConfig) -> Result<SessionHandle, SessionError> {
        if self.active.is_some() {
            info!("session already running, stopping current workers first");
            self.stop().await;
        }

        self.reset();
        self.state = SessionState::Starting;

        match self.launch(flood).await {
            Ok(run) => {
                let handle = run.handle.clone();
                self.active = Some(run);
                self.state = SessionState::Running;
                Ok(handle)
            }
            Err(e) => {
                self.cancel.cancel();
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Stop the running worker set. `None` if nothing was running.
    ///
    /// Every wait shares one deadline, the configured grace period from the
    /// call, so this returns within it even when workers have to be killed
    /// or abandoned.
    pub async fn stop(&mut self) -> Option<StopReport> {
        let mut run = self.active.take()?;
        let deadline = tokio::time::Instant::now() + self.config.engine.stop_grace();
        self.state = SessionState::Stopping;
        info!(session_id = %run.handle.id, "stopping flood session");

        self.cancel.cancel();
        for worker in run.workers.iter_mut() {
            worker.cancel();
        }

        let mut joins = JoinSet::new();
        for mut worker in run.workers.drain(..) {
            joins.spawn(async move {
                let exit = worker.join(deadline).await;
                (worker.id(), exit)
            });
        }

        let mut exits = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(pair) => exits.push(pair),
                Err(e) => error!(error = %e, "worker join task failed"),
            }
        }
        exits.sort_by_key(|(id, _)| *id);

        for (id, exit) in exits.iter().filter(|(_, exit)| !exit.is_clean()) {
            warn!(worker_id = id, exit = %exit, "worker did not stop cleanly");
        }

        if tokio::time::timeout_at(deadline, &mut run.reporter).await.is_err() {
            warn!("reporting task did not stop in time");
            run.reporter.abort();
        }

        let final_snapshot = run.aggregator.sample(Instant::now());
        self.sink.on_stop(&final_snapshot);

        self.state = SessionState::Idle;
        let report = StopReport {
            handle: run.handle,
            exits,
            final_snapshot,
        };
        info!(
            session_id = %report.handle.id,
            clean = report.clean_exits(),
            forced = report.forced_exits(),
            "flood session stopped"
        );
        self.last_report = Some(report.clone());
        Some(report)
    }

    async fn launch(&self, flood: FloodConfig) -> Result<ActiveRun, SessionError> {
        flood.validate()?;
        self.config.governor.validate()?;

        let destination = resolve_target(&flood.target_address).await?;
        let packet_size = flood.packet_size();
        let source = match flood.protocol {
            Protocol::TcpSyn => {
                local_source_address(destination).map_err(|e| SessionError::AddressResolution {
                    address: destination.to_string(),
                    reason: format!("no local route: {}", e),
                })?
            }
            _ => Ipv4Addr::UNSPECIFIED,
        };

        let options = self
            .config
            .template
            .template_options(packet_size, flood.target_port, source);
        let pool = TemplatePool::build(flood.protocol, destination, &options)?;

        let shares = split_rate(
            flood.target_rate_bytes_per_sec,
            self.parallelism(&flood, packet_size),
        );
        let specs: Vec<WorkerSpec> = shares
            .iter()
            .enumerate()
            .map(|(id, &rate)| WorkerSpec {
                id,
                protocol: flood.protocol,
                destination,
                target_port: flood.target_port,
                source,
                rate_bytes_per_sec: rate,
                packet_size,
            })
            .collect();

        let aggregator = Arc::new(Aggregator::new(flood.target_rate_bytes_per_sec));
        let (workers, failures) = match self.config.engine.worker_mode {
            WorkerMode::Thread => self.spawn_threads(&specs, &pool, &aggregator),
            WorkerMode::Process => self.spawn_processes(&specs, &aggregator).await,
        };

        if workers.is_empty() {
            let reason = failures
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no workers requested".into());
            error!(protocol = %flood.protocol, %destination, reason = %reason, "no worker could start");
            return Err(SessionError::NoWorkers(reason));
        }
        if !failures.is_empty() {
            warn!(
                started = workers.len(),
                failed = failures.len(),
                "some workers failed to start, continuing with the rest"
            );
        }

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            protocol: flood.protocol,
            target: destination,
            target_port: flood.target_port,
            target_rate_bytes_per_sec: flood.target_rate_bytes_per_sec,
            packet_size,
            workers: workers.len(),
        };

        let reporter = spawn_reporter(
            aggregator.clone(),
            self.sink.clone(),
            self.config.engine.report_interval(),
            self.cancel.clone(),
        );

        info!(
            session_id = %handle.id,
            protocol = %handle.protocol,
            target = %handle.target,
            port = handle.target_port,
            rate_bytes_per_sec = handle.target_rate_bytes_per_sec,
            packet_size,
            workers = handle.workers,
            mode = ?self.config.engine.worker_mode,
            "flood session started"
        );

        Ok(ActiveRun {
            handle,
            aggregator,
            workers,
            reporter,
        })
    }

    /// Worker count. An explicit `parallelism` (per flood or in the engine
    /// config) is used as given. The CPU-count fallback is capped so every
    /// worker has at least one packet per second to send.
    fn parallelism(&self, flood: &FloodConfig, packet_size: usize) -> usize {
        if let Some(n) = flood.parallelism.or(self.config.engine.default_parallelism) {
            return n;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let useful = (flood.target_rate_bytes_per_sec / packet_size.max(1) as u64).max(1);
        let workers = cpus.min(usize::try_from(useful).unwrap_or(usize::MAX));
        if workers < cpus {
            debug!(cpus, workers, "rate too low to keep every CPU busy, using fewer workers");
        }
        workers
    }

    fn spawn_threads(
        &self,
        specs: &[WorkerSpec],
        pool: &TemplatePool,
        aggregator: &Arc<Aggregator>,
    ) -> (Vec<Box<dyn Worker>>, Vec<WorkerError>) {
        let mut workers: Vec<Box<dyn Worker>> = Vec::with_capacity(specs.len());
        let mut failures = Vec::new();
        for spec in specs {
            match ThreadWorker::spawn(spec, pool, &self.config.governor, aggregator.clone(), &self.cancel) {
                Ok(worker) => workers.push(Box::new(worker)),
                Err(e) => {
                    error!(worker_id = spec.id, error = %e, "worker failed to start");
                    failures.push(e);
                }
            }
        }
        (workers, failures)
    }

    async fn spawn_processes(
        &self,
        specs: &[WorkerSpec],
        aggregator: &Arc<Aggregator>,
    ) -> (Vec<Box<dyn Worker>>, Vec<WorkerError>) {
        let launcher = match ProcessLauncher::from_config(&self.config.engine) {
            Ok(launcher) => launcher,
            Err(e) => return (Vec::new(), vec![e]),
        };

        let mut workers: Vec<Box<dyn Worker>> = Vec::with_capacity(specs.len());
        let mut failures = Vec::new();
        for spec in specs {
            let launch = WorkerLaunch {
                spec: spec.clone(),
                governor: self.config.governor.clone(),
                template: self.config.template.clone(),
            };
            match ProcessWorker::spawn(&launch, &launcher, aggregator.clone()).await {
                Ok(worker) => workers.push(Box::new(worker)),
                Err(e) => {
                    error!(worker_id = spec.id, error = %e, "worker process failed to start");
                    failures.push(e);
                }
            }
        }
        (workers, failures)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Threads exit at their next check; process workers are killed when
        // their handles drop.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn session_with(engine: EngineConfig) -> Session {
        let config = StressConfig {
            engine,
            ..StressConfig::default()
        };
        Session::new(config, Arc::new(|_: &StatisticsSnapshot| {}))
    }

    #[test]
    fn test_split_rate_sums_to_total() {
        assert_eq!(split_rate(10, 3), vec![4, 3, 3]);
        assert_eq!(split_rate(9, 3), vec![3, 3, 3]);
        assert_eq!(split_rate(2, 4), vec![2, 0, 0, 0]);
        assert!(split_rate(100, 0).is_empty());

        for (total, n) in [(8_000_000u64, 7usize), (1, 1), (u64::MAX, 16)] {
            let shares = split_rate(total, n);
            assert_eq!(shares.len(), n);
            assert_eq!(shares.iter().map(|s| *s as u128).sum::<u128>(), total as u128);
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let good = {
            let mut cfg = FloodConfig::new(Protocol::Udp, "127.0.0.1", 1_000_000);
            cfg.target_port = 9;
            cfg
        };
        assert!(good.validate().is_ok());

        let mut cfg = good.clone();
        cfg.target_address = "  ".into();
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = good.clone();
        cfg.target_rate_bytes_per_sec = 0;
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = good.clone();
        cfg.parallelism = Some(0);
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = good.clone();
        cfg.target_port = 0;
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = good.clone();
        cfg.protocol = Protocol::TcpSyn;
        cfg.packet_size = Some(20);
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        // ICMP does not need a port.
        let icmp = FloodConfig::new(Protocol::Icmp, "127.0.0.1", 1_000_000);
        assert!(icmp.validate().is_ok());
        assert_eq!(icmp.packet_size(), 1472);
    }

    #[test]
    fn test_explicit_parallelism_is_honoured() {
        let session = session_with(EngineConfig {
            default_parallelism: Some(8),
            ..EngineConfig::default()
        });

        let mut flood = FloodConfig::new(Protocol::Udp, "127.0.0.1", 1_000_000);
        assert_eq!(session.parallelism(&flood, 1300), 8);

        flood.parallelism = Some(3);
        assert_eq!(session.parallelism(&flood, 1300), 3);

        // Far below one packet per second per worker, still as asked.
        flood.target_rate_bytes_per_sec = 2600;
        assert_eq!(session.parallelism(&flood, 1300), 3);
        flood.parallelism = None;
        assert_eq!(session.parallelism(&flood, 1300), 8);
    }

    #[test]
    fn test_cpu_fallback_capped_by_rate() {
        let session = session_with(EngineConfig::default());
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut flood = FloodConfig::new(Protocol::Udp, "127.0.0.1", 1_000_000_000);
        assert_eq!(session.parallelism(&flood, 1300), cpus);

        flood.target_rate_bytes_per_sec = 10;
        assert_eq!(session.parallelism(&flood, 1300), 1);
    }

    #[test]
    fn test_packet_errors_map_to_session_errors() {
        let e: SessionError = PacketError::AddressResolution {
            address: "nowhere".into(),
            reason: "nxdomain".into(),
        }
        .into();
        assert!(matches!(e, SessionError::AddressResolution { .. }));

        let e: SessionError = PacketError::InvalidConfiguration("bad".into()).into();
        assert!(matches!(e, SessionError::Configuration(_)));
    }

    #[test]
    fn test_reset_refreshes_token_when_idle() {
        let mut session = session_with(EngineConfig::default());
        session.cancel.cancel();
        assert!(session.reset());
        assert!(!session.cancel.is_cancelled());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
