//! Workers that run the burst loop on a dedicated OS thread.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::burst::{BurstLoop, BurstOutcome};
use super::clock::{Clock, SystemClock};
use super::sink::{open_sink, PacketSink};
use super::{Worker, WorkerError, WorkerExit, WorkerSpec};
use crate::config::{GovernorConfig, WorkerMode};
use crate::packet::{PoolCursor, TemplatePool};
use crate::stats::Aggregator;

/// Keeps the aggregator's active-worker gauge honest even if the loop panics
/// or its task is aborted.
pub(super) struct ActiveGuard(Arc<Aggregator>);

impl ActiveGuard {
    pub(super) fn new(aggregator: Arc<Aggregator>) -> Self {
        aggregator.worker_started();
        Self(aggregator)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.worker_finished();
    }
}

pub struct ThreadWorker {
    id: usize,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<BurstOutcome>>,
    exit: Option<WorkerExit>,
}

impl ThreadWorker {
    /// Acquire the send primitive on the caller's thread, then start the loop.
    ///
    /// A resource failure is returned before any thread exists.
    pub fn spawn(
        spec: &WorkerSpec,
        pool: &TemplatePool,
        governor: &GovernorConfig,
        aggregator: Arc<Aggregator>,
        cancel: &CancellationToken,
    ) -> Result<Self, WorkerError> {
        let sink = open_sink(spec.id, spec.protocol, spec.destination, spec.target_port)?;
        Self::spawn_with(
            spec,
            sink,
            SystemClock,
            pool.cursor(spec.id),
            governor.clone(),
            aggregator,
            cancel,
        )
    }

    /// Start a loop over an already-acquired sink and clock.
    pub fn spawn_with<S, C>(
        spec: &WorkerSpec,
        sink: S,
        clock: C,
        cursor: PoolCursor,
        governor: GovernorConfig,
        aggregator: Arc<Aggregator>,
        cancel: &CancellationToken,
    ) -> Result<Self, WorkerError>
    where
        S: PacketSink + 'static,
        C: Clock + 'static,
    {
        let id = spec.id;
        let cancel = cancel.child_token();
        let burst = BurstLoop::new(
            spec,
            sink,
            clock,
            cursor,
            governor,
            aggregator.clone(),
            cancel.clone(),
        );
        let (tx, rx) = oneshot::channel();
        let guard = ActiveGuard::new(aggregator);

        std::thread::Builder::new()
            .name(format!("stressgen-worker-{}", id))
            .spawn(move || {
                let outcome = burst.run();
                drop(guard);
                let _ = tx.send(outcome);
            })
            .map_err(|e| WorkerError::Spawn {
                worker_id: id,
                reason: e.to_string(),
            })?;

        debug!(worker_id = id, "worker thread started");
        Ok(Self {
            id,
            cancel,
            done: Some(rx),
            exit: None,
        })
    }
}

#[async_trait::async_trait]
impl Worker for ThreadWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn mode(&self) -> WorkerMode {
        WorkerMode::Thread
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
    }

    async fn join(&mut self, deadline: Instant) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let Some(done) = self.done.take() else {
            return WorkerExit::Abandoned;
        };

        self.cancel.cancel();
        let exit = match tokio::time::timeout_at(deadline, done).await {
            Ok(Ok(outcome)) => WorkerExit::Finished {
                packets: outcome.totals.packets,
                drops: outcome.totals.drops,
            },
            Ok(Err(_)) => WorkerExit::Failed {
                reason: "worker thread exited without reporting".into(),
            },
            Err(_) => {
                // The thread cannot be killed; it is left to exit at its next
                // cancellation check.
                warn!(
                    worker_id = self.id,
                    "worker thread did not stop within grace period, detaching"
                );
                WorkerExit::Abandoned
            }
        };

        self.exit = Some(exit.clone());
        exit
    }
}
