//! Workers that run in child processes.
//!
//! The parent launches `<program> worker --launch <json>` in its own process
//! group, waits for the child's `ready` line, then merges `progress` lines
//! into the session aggregator. Closing the child's stdin asks it to stop;
//! if it has not exited shortly before the join deadline, the process group
//! and every descendant seen under the child are killed. Descendants are
//! recorded while the child is still alive to parent them, which also
//! catches those that left the group with `setsid`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{WorkerLaunch, WorkerMessage};
use super::thread::{ActiveGuard, ThreadWorker};
use super::{Worker, WorkerError, WorkerExit};
use crate::config::{EngineConfig, WorkerMode};
use crate::packet::TemplatePool;
use crate::stats::Aggregator;

/// How long a child gets to report `ready` or `failed`.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a child killed during startup.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);
/// Share of the join budget kept back for killing and reaping.
const KILL_RESERVE: Duration = Duration::from_millis(100);
/// Cadence of `progress` lines from a child.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
/// Grace the child gives its own send thread.
const CHILD_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Parent side
// ---------------------------------------------------------------------------

/// Program and leading arguments used to start worker processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `engine.worker_program`, or this executable, with the `worker`
    /// subcommand.
    pub fn from_config(engine: &EngineConfig) -> Result<Self, WorkerError> {
        let program = match &engine.worker_program {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| WorkerError::Spawn {
                worker_id: 0,
                reason: format!("cannot locate current executable: {}", e),
            })?,
        };
        Ok(Self::new(program, vec!["worker".to_string()]))
    }

    fn command(&self, launch: &WorkerLaunch) -> Result<Command, WorkerError> {
        let json = serde_json::to_string(launch).map_err(|e| WorkerError::Spawn {
            worker_id: launch.spec.id,
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--launch")
            .arg(json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }
}

#[derive(Debug, Default)]
struct ReaderSummary {
    packets: u64,
    drops: u64,
    finished: bool,
    failure: Option<String>,
}

pub struct ProcessWorker {
    id: usize,
    child: Child,
    pgid: Option<u32>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<ReaderSummary>>,
    exit: Option<WorkerExit>,
}

impl ProcessWorker {
    /// Launch a worker process and wait for it to acquire its send primitive.
    pub async fn spawn(
        launch: &WorkerLaunch,
        launcher: &ProcessLauncher,
        aggregator: Arc<Aggregator>,
    ) -> Result<Self, WorkerError> {
        let id = launch.spec.id;
        let mut child = launcher
            .command(launch)?
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                worker_id: id,
                reason: format!("{}: {}", launcher.program.display(), e),
            })?;
        let pgid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            worker_id: id,
            reason: "worker stdout not captured".into(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let startup = tokio::time::timeout(STARTUP_TIMEOUT, wait_ready(&mut lines)).await;
        let failure = match startup {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(WorkerError::Resource {
                worker_id: id,
                reason,
            }),
            Err(_) => Some(WorkerError::Spawn {
                worker_id: id,
                reason: format!("no ready message within {:?}", STARTUP_TIMEOUT),
            }),
        };
        if let Some(err) = failure {
            kill_group(&mut child, pgid);
            let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
            return Err(err);
        }

        let active = ActiveGuard::new(aggregator.clone());
        let reader = tokio::spawn(read_progress(id, lines, aggregator, active));
        info!(worker_id = id, pid = pgid, "worker process ready");

        Ok(Self {
            id,
            child,
            pgid,
            stdin,
            reader: Some(reader),
            exit: None,
        })
    }

    /// Wait for the progress reader to drain, abandoning it at `deadline`.
    async fn finish_reader(&mut self, deadline: Instant) -> ReaderSummary {
        let Some(mut handle) = self.reader.take() else {
            return ReaderSummary::default();
        };
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(worker_id = self.id, error = %e, "progress reader failed");
                ReaderSummary::default()
            }
            Err(_) => {
                warn!(worker_id = self.id, "worker output still open at deadline");
                handle.abort();
                ReaderSummary::default()
            }
        }
    }

    /// SIGKILL the group, everything recorded in `tree`, and anything
    /// currently under the child. A reaped child's pid may already belong to
    /// someone else, so only a live child is walked again.
    fn kill_all(&mut self, tree: &mut Vec<Descendant>) {
        if let (Some(pid), Ok(None)) = (self.pgid, self.child.try_wait()) {
            merge_descendants(tree, descendants(pid));
        }
        kill_descendants(tree);
        kill_group(&mut self.child, self.pgid);
    }
}

#[async_trait::async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn mode(&self) -> WorkerMode {
        WorkerMode::Process
    }

    fn cancel(&mut self) {
        // EOF on stdin is the child's stop signal.
        self.stdin.take();
    }

    async fn join(&mut self, deadline: Instant) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let mut tree = self.pgid.map(descendants).unwrap_or_default();
        self.cancel();

        let reserve = KILL_RESERVE.min(deadline.saturating_duration_since(Instant::now()) / 4);
        let cooperative_until = deadline.checked_sub(reserve).unwrap_or(deadline);

        let exit = match tokio::time::timeout_at(cooperative_until, self.child.wait()).await {
            Ok(Ok(status)) => {
                // Reap anything the worker left behind.
                self.kill_all(&mut tree);
                let summary = self.finish_reader(deadline).await;
                match summary.failure {
                    Some(reason) => WorkerExit::Failed { reason },
                    None if status.success() || summary.finished => WorkerExit::Finished {
                        packets: summary.packets,
                        drops: summary.drops,
                    },
                    None => WorkerExit::Failed {
                        reason: format!("worker process exited with {}", status),
                    },
                }
            }
            Ok(Err(e)) => {
                self.kill_all(&mut tree);
                self.finish_reader(deadline).await;
                WorkerExit::Failed {
                    reason: format!("failed to wait for worker process: {}", e),
                }
            }
            Err(_) => {
                warn!(
                    worker_id = self.id,
                    pid = self.pgid,
                    descendants = tree.len(),
                    "worker process did not exit within grace period, killing it and its descendants"
                );
                self.kill_all(&mut tree);
                if tokio::time::timeout_at(deadline, self.child.wait()).await.is_err() {
                    warn!(worker_id = self.id, "killed worker process not yet reaped");
                }
                self.finish_reader(deadline).await;
                WorkerExit::Killed
            }
        };

        debug!(worker_id = self.id, exit = %exit, "worker process joined");
        self.exit = Some(exit.clone());
        exit
    }
}

/// SIGKILL the child's whole process group.
fn kill_group(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            unsafe {
                libc::kill(-(pgid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    let _ = child.start_kill();
}

/// A process found under a worker. The start time guards against signalling
/// a recycled pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Descendant {
    pid: u32,
    start_ticks: u64,
}

/// Every live process below `root`, walking `/proc/<pid>/task/*/children`.
#[cfg(target_os = "linux")]
fn descendants(root: u32) -> Vec<Descendant> {
    let mut found = Vec::new();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        for child in child_pids(pid) {
            if let Some(start_ticks) = start_ticks(child) {
                found.push(Descendant {
                    pid: child,
                    start_ticks,
                });
                pending.push(child);
            }
        }
    }
    found
}

#[cfg(not(target_os = "linux"))]
fn descendants(_root: u32) -> Vec<Descendant> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn child_pids(pid: u32) -> Vec<u32> {
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{}/task", pid)) else {
        return Vec::new();
    };
    let mut pids = Vec::new();
    for task in tasks.flatten() {
        if let Ok(children) = std::fs::read_to_string(task.path().join("children")) {
            pids.extend(children.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
        }
    }
    pids
}

/// Field 22 (`starttime`) of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name is parenthesised and may itself contain spaces.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn start_ticks(_pid: u32) -> Option<u64> {
    None
}

fn merge_descendants(tree: &mut Vec<Descendant>, more: Vec<Descendant>) {
    for d in more {
        if !tree.contains(&d) {
            tree.push(d);
        }
    }
}

fn kill_descendants(tree: &[Descendant]) {
    #[cfg(unix)]
    {
        for d in tree {
            if start_ticks(d.pid) == Some(d.start_ticks) {
                unsafe {
                    libc::kill(d.pid as i32, libc::SIGKILL);
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tree;
}

/// Consume lines until the child reports `ready` (Ok) or fails (Err).
async fn wait_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<(), String> {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match WorkerMessage::parse(&line) {
                Ok(WorkerMessage::Ready { .. }) => return Ok(()),
                Ok(WorkerMessage::Failed { reason, .. }) => return Err(reason),
                Ok(other) => debug!(message = ?other, "unexpected message before ready"),
                Err(_) => debug!(line = %line, "ignoring non-protocol worker output"),
            },
            Ok(None) => return Err("worker exited before becoming ready".into()),
            Err(e) => return Err(format!("failed to read worker output: {}", e)),
        }
    }
}

/// Merge a running child's progress into the session aggregator until its
/// stdout closes.
async fn read_progress(
    worker_id: usize,
    mut lines: Lines<BufReader<ChildStdout>>,
    aggregator: Arc<Aggregator>,
    _active: ActiveGuard,
) -> ReaderSummary {
    let mut summary = ReaderSummary::default();

    while let Ok(Some(line)) = lines.next_line().await {
        match WorkerMessage::parse(&line) {
            Ok(WorkerMessage::Progress {
                packets,
                bytes,
                drops,
            }) => {
                aggregator.record_sent(packets, bytes);
                if drops > 0 {
                    aggregator.record_drops(drops);
                }
                summary.packets += packets;
                summary.drops += drops;
            }
            Ok(WorkerMessage::Finished { packets, drops, .. }) => {
                summary.packets = packets;
                summary.drops = drops;
                summary.finished = true;
            }
            Ok(WorkerMessage::Failed { reason, .. }) => {
                warn!(worker_id, reason = %reason, "worker process reported failure");
                summary.failure = Some(reason);
            }
            Ok(WorkerMessage::Ready { .. }) => {}
            Err(_) => debug!(worker_id, line = %line, "ignoring non-protocol worker output"),
        }
    }

    summary
}

// ---------------------------------------------------------------------------
// Child side
// ---------------------------------------------------------------------------

/// Body of the `worker` subcommand.
///
/// Runs one thread worker for `launch.spec`, reports on stdout, and returns
/// once stdin is closed and the send thread has stopped.
pub async fn run_worker_process(launch: WorkerLaunch) -> anyhow::Result<()> {
    let spec = &launch.spec;
    let mut out = tokio::io::stdout();

    let options = launch
        .template
        .template_options(spec.packet_size, spec.target_port, spec.source);
    let pool = match TemplatePool::build(spec.protocol, spec.destination, &options) {
        Ok(pool) => pool,
        Err(e) => {
            report_failure(&mut out, spec.id, &e.to_string()).await;
            return Err(e).context("failed to build packet templates");
        }
    };

    let aggregator = Arc::new(Aggregator::new(spec.rate_bytes_per_sec));
    let cancel = CancellationToken::new();
    let mut worker =
        match ThreadWorker::spawn(spec, &pool, &launch.governor, aggregator.clone(), &cancel) {
            Ok(worker) => worker,
            Err(e) => {
                report_failure(&mut out, spec.id, &e.to_string()).await;
                return Err(e.into());
            }
        };

    emit(&mut out, &WorkerMessage::Ready { worker_id: spec.id }).await?;

    let mut reported = Reported::default();
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let stdin_closed = wait_for_eof();
    tokio::pin!(stdin_closed);

    loop {
        tokio::select! {
            biased;

            _ = &mut stdin_closed => {
                debug!(worker_id = spec.id, "stdin closed, stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = reported.emit_delta(&mut out, &aggregator).await {
                    // Parent is gone.
                    debug!(worker_id = spec.id, error = %e, "progress write failed, stopping");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let exit = worker.join(Instant::now() + CHILD_GRACE).await;
    reported.emit_delta(&mut out, &aggregator).await?;

    let last = match exit {
        WorkerExit::Finished { packets, drops } => WorkerMessage::Finished {
            worker_id: spec.id,
            packets,
            drops,
        },
        other => WorkerMessage::Failed {
            worker_id: spec.id,
            reason: other.to_string(),
        },
    };
    emit(&mut out, &last).await
}

/// Counter values already sent to the parent.
#[derive(Debug, Default)]
struct Reported {
    packets: u64,
    bytes: u64,
    drops: u64,
}

impl Reported {
    async fn emit_delta(
        &mut self,
        out: &mut tokio::io::Stdout,
        aggregator: &Aggregator,
    ) -> anyhow::Result<()> {
        let (packets, bytes, drops) = (
            aggregator.total_packets(),
            aggregator.total_bytes(),
            aggregator.total_drops(),
        );
        if packets == self.packets && drops == self.drops {
            return Ok(());
        }
        let delta = WorkerMessage::Progress {
            packets: packets - self.packets,
            bytes: bytes - self.bytes,
            drops: drops - self.drops,
        };
        emit(out, &delta).await?;
        *self = Reported {
            packets,
            bytes,
            drops,
        };
        Ok(())
    }
}

async fn emit(out: &mut tokio::io::Stdout, message: &WorkerMessage) -> anyhow::Result<()> {
    out.write_all(message.to_line()?.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn report_failure(out: &mut tokio::io::Stdout, worker_id: usize, reason: &str) {
    let message = WorkerMessage::Failed {
        worker_id,
        reason: reason.to_string(),
    };
    if let Err(e) = emit(out, &message).await {
        warn!(worker_id, error = %e, "could not report failure to parent");
    }
}

async fn wait_for_eof() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{GovernorConfig, TemplateConfig};
    use crate::worker::burst::tests::udp_spec;

    fn launch() -> WorkerLaunch {
        WorkerLaunch {
            spec: udp_spec(1_000_000),
            governor: GovernorConfig::default(),
            template: TemplateConfig::default(),
        }
    }

    fn shell(script: &str) -> ProcessLauncher {
        // Trailing "--" makes the appended --launch argument a positional
        // parameter the script ignores.
        ProcessLauncher::new("sh", vec!["-c".into(), script.into(), "--".into()])
    }

    const READY: &str = r#"printf '%s\n' '{"event":"ready","worker_id":0}'"#;

    #[tokio::test]
    async fn test_cooperative_exit_merges_progress() {
        let script = format!(
            r#"{}; printf '%s\n' '{{"event":"progress","packets":5,"bytes":6500,"drops":1}}'; cat >/dev/null; printf '%s\n' '{{"event":"finished","worker_id":0,"packets":5,"drops":1}}'"#,
            READY
        );
        let agg = Arc::new(Aggregator::new(1_000_000));
        let mut worker = ProcessWorker::spawn(&launch(), &shell(&script), agg.clone())
            .await
            .unwrap();
        assert_eq!(agg.active_workers(), 1);

        let exit = worker.join(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(exit, WorkerExit::Finished { packets: 5, drops: 1 });
        assert_eq!(agg.total_packets(), 5);
        assert_eq!(agg.total_bytes(), 6500);
        assert_eq!(agg.total_drops(), 1);
        assert_eq!(agg.active_workers(), 0);
        assert_eq!(worker.mode(), WorkerMode::Process);
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_killed_after_grace() {
        let script = format!("{}; trap '' TERM; sleep 30", READY);
        let agg = Arc::new(Aggregator::new(1_000_000));
        let mut worker = ProcessWorker::spawn(&launch(), &shell(&script), agg.clone())
            .await
            .unwrap();

        let started = Instant::now();
        let exit = worker.join(started + Duration::from_millis(300)).await;

        assert_eq!(exit, WorkerExit::Killed);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(agg.active_workers(), 0);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        stat.rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X")
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_reaches_descendants_outside_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("escaped.pid");
        let script = format!(
            "{}; trap '' TERM; setsid sleep 30 & echo $! > {}; sleep 30",
            READY,
            pidfile.display()
        );
        let agg = Arc::new(Aggregator::new(1_000_000));
        let mut worker = ProcessWorker::spawn(&launch(), &shell(&script), agg.clone())
            .await
            .unwrap();

        let waiting = Instant::now();
        let escaped: u32 = loop {
            if let Some(pid) = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                break pid;
            }
            assert!(waiting.elapsed() < Duration::from_secs(5), "pid file never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(is_running(escaped));

        let started = Instant::now();
        let exit = worker.join(started + Duration::from_millis(300)).await;
        assert_eq!(exit, WorkerExit::Killed);
        assert!(started.elapsed() < Duration::from_millis(400));

        let gone_by = Instant::now() + Duration::from_secs(2);
        while is_running(escaped) && Instant::now() < gone_by {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(escaped), "process {} survived its worker", escaped);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descendants_lists_live_children() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let found = descendants(std::process::id());
        let _ = child.kill();
        let _ = child.wait();

        let entry = found.iter().find(|d| d.pid == child.id()).copied();
        assert!(entry.is_some(), "{} not in {:?}", child.id(), found);
        // A reaped pid no longer matches its recorded start time.
        assert_ne!(start_ticks(child.id()), entry.map(|d| d.start_ticks));
    }

    #[tokio::test]
    async fn test_reported_failure_is_a_spawn_error() {
        let script = r#"printf '%s\n' '{"event":"failed","worker_id":0,"reason":"permission denied"}'"#;
        let agg = Arc::new(Aggregator::new(1_000_000));
        let err = match ProcessWorker::spawn(&launch(), &shell(script), agg.clone()).await {
            Ok(_) => panic!("expected startup failure"),
            Err(e) => e,
        };
        assert!(matches!(err, WorkerError::Resource { .. }));
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(agg.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let launcher = ProcessLauncher::new("/nonexistent/stressgen-worker", vec![]);
        let agg = Arc::new(Aggregator::new(1));
        let err = match ProcessWorker::spawn(&launch(), &launcher, agg).await {
            Ok(_) => panic!("expected spawn failure"),
            Err(e) => e,
        };
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }
}
