//! The duplication pipeline.
//!
//! A fixed cycle of typed stages: `Load` reads freshly committed mutations from the
//! replica's in-memory window, falling back to `LoadFromLog` for data which has already
//! left the window; both feed `Ship`, which sends the batch to the remote cluster and
//! folds the acknowledged decree back into the task's progress before the cycle repeats.
//! Log loading runs on the blocking lane so historical backfill cannot starve the
//! shipping of fresh mutations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::duplication::{verify_start_decree, DuplicationCtlMsg, RemoteSink, SharedProgress};
use crate::error::ShutdownError;
use crate::primitives::{Decree, DuplicationProgress, Mutation};
use crate::replica::Replica;

/// The base delay between attempts to ship a batch after a transient failure.
const SHIP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The desired state of a duplication pipeline, driven by its owning coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// The pipeline cycle is running.
    Running,
    /// The pipeline is paused; in-flight stage work drains, nothing new starts.
    Paused,
}

/// The stages of the duplication cycle.
///
/// Transitions are fixed: `Load` -> `Ship` when the window covers the read frontier,
/// `Load` -> `LoadFromLog` -> `Ship` for historical data, and `Ship` -> `Load` to close
/// the cycle. `Halt` terminates the pipeline task.
enum Stage {
    /// Read the next batch from the in-memory recent-mutation window.
    Load,
    /// Read the next batch from the private log, starting at the given decree.
    LoadFromLog { start: Decree },
    /// Ship the given batch to the remote cluster and await acknowledgment.
    Ship { batch: Vec<Mutation> },
    /// Terminate the pipeline task.
    Halt,
}

/// The driver of one duplication task's load/ship cycle.
pub struct DuplicationPipeline {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The replica whose log is being duplicated.
    replica: Replica,
    /// The remote cluster receiving duplicated mutations.
    remote: Arc<dyn RemoteSink>,
    /// The owning task's progress watermarks.
    progress: Arc<SharedProgress>,

    /// The desired pipeline state, driven by the owning coordinator.
    desired: watch::Receiver<PipelineState>,
    /// A signal of the replica's last committed decree.
    commits: watch::Receiver<Decree>,
    /// A channel to the owning coordinator, used to surface pipeline failure.
    events_tx: mpsc::Sender<DuplicationCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl DuplicationPipeline {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, replica: Replica, remote: Arc<dyn RemoteSink>, progress: Arc<SharedProgress>, desired: watch::Receiver<PipelineState>,
        events_tx: mpsc::Sender<DuplicationCtlMsg>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let commits = replica.commit_signal();
        Self {
            config,
            replica,
            remote,
            progress,
            desired,
            commits,
            events_tx,
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("duplication pipeline {} has started", self.replica.gpid());

        let mut stage = Stage::Load;
        loop {
            if !self.wait_until_running().await {
                break;
            }
            stage = match stage {
                Stage::Load => self.load().await,
                Stage::LoadFromLog { start } => self.load_from_log(start).await,
                Stage::Ship { batch } => self.ship(batch).await,
                Stage::Halt => break,
            };
        }

        tracing::debug!("duplication pipeline {} has shutdown", self.replica.gpid());
        Ok(())
    }

    /// Gate stage transitions on the desired pipeline state.
    ///
    /// Returns `false` when the coordinator is gone and the pipeline must terminate.
    async fn wait_until_running(&mut self) -> bool {
        loop {
            if *self.desired.borrow_and_update() == PipelineState::Running {
                return true;
            }
            if self.desired.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Wait until the replica has committed data at or beyond the given decree.
    ///
    /// Returns `false` when the pipeline must terminate; returns `true` either when data
    /// is available or when a pause has been requested, in which case the caller yields
    /// back to the stage gate.
    async fn wait_for_new_data(&mut self, start: Decree) -> bool {
        while self.replica.last_committed_decree() < start {
            tokio::select! {
                res = self.commits.changed() => {
                    if res.is_err() {
                        return false;
                    }
                }
                res = self.desired.changed() => {
                    if res.is_err() {
                        return false;
                    }
                    if *self.desired.borrow() == PipelineState::Paused {
                        return true;
                    }
                }
            }
        }
        true
    }

    /// The `Load` stage: read the next batch from the in-memory window, or divert to the
    /// private log for data which has already left it.
    async fn load(&mut self) -> Stage {
        let start = self.progress.get().last_decree + 1;
        if !self.wait_for_new_data(start).await {
            return Stage::Halt;
        }
        if self.replica.last_committed_decree() < start {
            // A pause interrupted the wait; yield back to the stage gate.
            return Stage::Load;
        }

        let window = self.replica.prepare_window();
        let window_covers_start = window.first().map(|mutation| mutation.decree <= start).unwrap_or(false);
        if !window_covers_start {
            // The data has already left the window; verify the log still holds it
            // before reading history.
            if let Err(err) = verify_start_decree(&self.progress, &self.replica.log(), start) {
                tracing::error!(error = ?err, "duplication pipeline {} cannot load from private log", self.replica.gpid());
                let _ = self.events_tx.send(DuplicationCtlMsg::PipelineFailed(err)).await;
                return Stage::Halt;
            }
            return Stage::LoadFromLog { start };
        }

        let max = self.config.duplication_batch_size as usize;
        let batch: Vec<_> = window.into_iter().filter(|mutation| mutation.decree >= start).take(max).collect();
        if batch.is_empty() {
            return Stage::Load;
        }
        match self.note_loaded(&batch) {
            Ok(()) => Stage::Ship { batch },
            Err(err) => self.fatal(err),
        }
    }

    /// The `LoadFromLog` stage: read the next batch of historical mutations.
    async fn load_from_log(&mut self, start: Decree) -> Stage {
        let through = self.replica.last_committed_decree();
        let max = self.config.duplication_batch_size as usize;
        let batch = match self.replica.log().read_range(start, through, max).await {
            Ok(batch) => batch,
            Err(err) => return self.fatal(ShutdownError(err)),
        };
        if batch.is_empty() {
            // The range may have landed in the window only; retry from the top of the cycle.
            return Stage::Load;
        }
        match self.note_loaded(&batch) {
            Ok(()) => Stage::Ship { batch },
            Err(err) => self.fatal(err),
        }
    }

    /// The `Ship` stage: send the batch to the remote cluster and fold the acknowledged
    /// decree into the task's progress.
    ///
    /// Transient send failures are retried with backoff; a partial acknowledgment trims
    /// the confirmed prefix from the batch and re-ships the remainder.
    async fn ship(&mut self, mut batch: Vec<Mutation>) -> Stage {
        let last_in_batch = match batch.last() {
            Some(mutation) => mutation.decree,
            None => return Stage::Load,
        };
        loop {
            if *self.desired.borrow() == PipelineState::Paused {
                // Retain the batch; the stage gate resumes it from the last known progress.
                return Stage::Ship { batch };
            }
            match self.remote.ship(self.replica.gpid(), &batch).await {
                Ok(confirmed) => {
                    let progress = DuplicationProgress { last_decree: last_in_batch, confirmed_decree: confirmed };
                    if let Err(err) = self.progress.update(progress) {
                        return self.fatal(err);
                    }
                    if confirmed >= last_in_batch {
                        return Stage::Load;
                    }
                    tracing::debug!(confirmed, last_in_batch, "partial acknowledgment from remote cluster, re-shipping remainder");
                    let no_progress = batch.first().map(|mutation| confirmed < mutation.decree).unwrap_or(true);
                    batch.retain(|mutation| mutation.decree > confirmed);
                    if no_progress {
                        tokio::time::sleep(SHIP_RETRY_DELAY).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "error shipping duplication batch for {}, will retry", self.replica.gpid());
                    let jitter = rand::thread_rng().gen_range(0..500);
                    tokio::time::sleep(SHIP_RETRY_DELAY + Duration::from_millis(jitter)).await;
                }
            }
        }
    }

    /// Record the read frontier after a batch has been loaded.
    fn note_loaded(&self, batch: &[Mutation]) -> Result<(), ShutdownError> {
        if let Some(last) = batch.last() {
            self.progress.update(DuplicationProgress {
                last_decree: last.decree,
                confirmed_decree: 0,
            })?;
        }
        Ok(())
    }

    /// Handle a fatal consistency error: broadcast a shutdown and halt the pipeline.
    fn fatal(&self, err: ShutdownError) -> Stage {
        tracing::error!(error = ?err, "fatal error in duplication pipeline {}, shutting down", self.replica.gpid());
        let _ = self.shutdown_tx.send(());
        Stage::Halt
    }
}
