//! Duplication controller.
//!
//! Each duplication task continuously ships one partition's committed mutations to a
//! remote cluster. The controller here owns exactly one task: its status, its progress
//! watermarks and the load/ship pipeline doing the work. Progress is a pair of decrees,
//! `last_decree` (highest decree read locally) and `confirmed_decree` (highest decree
//! durably received remotely); `confirmed_decree` never regresses, and the pipeline may
//! only trust log reads which start beyond the log's garbage-collection watermark.

mod pipeline;
#[cfg(test)]
mod pipeline_test;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::error::{LogTruncatedError, ShutdownError, ShutdownResult};
use crate::log::MutationLog;
use crate::meta::DuplicationDescriptor;
use crate::primitives::{Decree, DuplicationProgress, DuplicationStatus, Gpid, Mutation};
use crate::replica::Replica;
use self::pipeline::{DuplicationPipeline, PipelineState};

/// The interval on which duplication metrics are recomputed.
const METRICS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

const METRIC_DUP_PENDING: &str = "helix_duplication_pending_mutations";
const METRIC_DUP_CONFIRMED_DELTA: &str = "helix_duplication_confirmed_decree_delta";

/// A sink for duplicated mutations on the remote cluster.
#[async_trait]
pub trait RemoteSink: Send + Sync + 'static {
    /// Ship a batch of committed mutations tagged with their originating decrees,
    /// returning the highest decree durably received by the remote cluster.
    async fn ship(&self, gpid: Gpid, batch: &[Mutation]) -> Result<Decree>;
}

/// The progress watermarks of one duplication task.
///
/// All updates go through [`SharedProgress::update`] under the exclusive side of the
/// lock, and all reads go through [`SharedProgress::get`]; the two decree fields are
/// never touched directly by any other component.
pub struct SharedProgress {
    progress: RwLock<DuplicationProgress>,
}

impl SharedProgress {
    /// Create a new instance seeded from the metadata service's confirmed decree.
    pub fn new(confirmed_decree: Decree) -> Self {
        Self {
            progress: RwLock::new(DuplicationProgress {
                last_decree: confirmed_decree,
                confirmed_decree,
            }),
        }
    }

    /// A point-in-time snapshot of the progress watermarks.
    pub fn get(&self) -> DuplicationProgress {
        *self.progress.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge an externally observed progress into the tracked state.
    ///
    /// `confirmed_decree` tracks remotely durable state and must never regress; an update
    /// presenting a smaller value than currently held is a fatal consistency error, as is
    /// a merged state where `confirmed_decree` exceeds `last_decree`. A `confirmed_decree`
    /// of `0` carries no confirmation.
    pub fn update(&self, p: DuplicationProgress) -> ShutdownResult<()> {
        let mut progress = self.progress.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if p.confirmed_decree > 0 && p.confirmed_decree < progress.confirmed_decree {
            return Err(ShutdownError(anyhow!(
                "confirmed decree may never decrease: new({}) old({})",
                p.confirmed_decree,
                progress.confirmed_decree
            )));
        }
        progress.confirmed_decree = progress.confirmed_decree.max(p.confirmed_decree);
        progress.last_decree = progress.last_decree.max(p.last_decree);
        if progress.confirmed_decree > progress.last_decree {
            return Err(ShutdownError(anyhow!(
                "last_decree({}) should always be at least confirmed_decree({})",
                progress.last_decree,
                progress.confirmed_decree
            )));
        }
        Ok(())
    }
}

/// Check that the private log still holds all data needed to duplicate from the given
/// decree onward.
///
/// Returns a [`LogTruncatedError`] when the log's garbage-collection watermark has
/// reached the start decree, in which case the task cannot proceed and must be surfaced
/// to the operator/metadata service.
fn verify_start_decree(progress: &SharedProgress, log: &MutationLog, start_decree: Decree) -> Result<()> {
    let p = progress.get();
    let max_gced_decree = log.max_gced_decree()?;
    if max_gced_decree >= start_decree {
        return Err(LogTruncatedError {
            max_gced_decree,
            start_decree,
            confirmed_decree: p.confirmed_decree,
            last_decree: p.last_decree,
        }
        .into());
    }
    Ok(())
}

/// A structured status snapshot of one duplication task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DuplicationStatusSnapshot {
    /// The task's ID.
    pub dupid: u64,
    /// The task's status.
    pub status: DuplicationStatus,
    /// The remote cluster address.
    pub remote: String,
    /// The task's confirmed decree.
    pub confirmed: Decree,
    /// The name of the owning application.
    pub app: String,
}

/// A controller encapsulating all logic for driving one duplication task.
pub struct DuplicationCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The replica whose log is being duplicated.
    replica: Replica,
    /// The unique ID of the duplication task.
    id: u64,
    /// The remote cluster address.
    remote_address: String,

    /// The task's status, observable by handles.
    status_tx: watch::Sender<DuplicationStatus>,
    /// The task's progress watermarks, shared with the pipeline.
    progress: Arc<SharedProgress>,
    /// The confirmed decree recorded at the last metrics tick.
    last_recorded_confirmed_decree: Decree,

    /// The desired pipeline state.
    desired_tx: watch::Sender<PipelineState>,
    /// The join handle of the pipeline task.
    pipeline: Option<JoinHandle<Result<()>>>,

    /// A channel of events to be processed by this controller.
    events_tx: mpsc::Sender<DuplicationCtlMsg>,
    /// A channel of events to be processed by this controller.
    events_rx: ReceiverStream<DuplicationCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl DuplicationCtl {
    /// Create a new instance from a duplication task descriptor.
    ///
    /// The descriptor must carry a confirmed-decree entry for this partition; a
    /// descriptor without one indicates a logic error in the metadata layer and is fatal.
    pub fn new(
        config: Arc<Config>, replica: Replica, remote: Arc<dyn RemoteSink>, descriptor: DuplicationDescriptor, shutdown_tx: broadcast::Sender<()>,
        events_tx: mpsc::Sender<DuplicationCtlMsg>, events_rx: mpsc::Receiver<DuplicationCtlMsg>,
    ) -> ShutdownResult<Self> {
        let partition = replica.gpid().partition;
        let meta_confirmed_decree = descriptor
            .progress
            .get(&partition)
            .copied()
            .ok_or_else(|| ShutdownError(anyhow!("duplication descriptor {} carries no progress entry for partition {}", descriptor.id, partition)))?;
        let progress = Arc::new(SharedProgress::new(meta_confirmed_decree));
        tracing::debug!(
            dupid = descriptor.id,
            meta_confirmed_decree,
            "initializing duplication controller for {}",
            replica.gpid()
        );

        metrics::register_gauge!(METRIC_DUP_PENDING, metrics::Unit::Count, "number of mutations pending duplication");
        metrics::register_gauge!(
            METRIC_DUP_CONFIRMED_DELTA,
            metrics::Unit::Count,
            "growth of the confirmed decree since the last metrics tick"
        );

        let (status_tx, _status_rx) = watch::channel(descriptor.status);
        let (desired_tx, desired_rx) = watch::channel(PipelineState::Paused);
        let pipeline = DuplicationPipeline::new(
            config.clone(),
            replica.clone(),
            remote,
            progress.clone(),
            desired_rx,
            events_tx.clone(),
            shutdown_tx.clone(),
        )
        .spawn();

        let this = Self {
            config,
            replica,
            id: descriptor.id,
            remote_address: descriptor.remote,
            status_tx,
            last_recorded_confirmed_decree: progress.get().confirmed_decree,
            progress,
            desired_tx,
            pipeline: Some(pipeline),
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            descheduled: false,
        };
        if descriptor.status == DuplicationStatus::Running {
            this.start();
        }
        Ok(this)
    }

    /// Get a handle to this controller, for status & progress inspection and messaging.
    pub fn handle(&self) -> DuplicationHandle {
        DuplicationHandle {
            id: self.id,
            tx: self.events_tx.clone(),
            progress: self.progress.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("duplication controller {}/{} has started", self.config.app_name, self.id);

        let mut metrics_interval = tokio::time::interval(METRICS_UPDATE_INTERVAL);
        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => self.handle_msg(msg_opt).await,
                _ = metrics_interval.tick() => self.update_metrics(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. The metrics tick is stopped first, then the pipeline is
        // paused and drained, so no stage work touches controller state after this point.
        // Dropping the desired-state sender is what releases a pipeline parked at its
        // stage gate; in-flight stage work still runs to completion before the join.
        drop(metrics_interval);
        let description = self.describe();
        let Self { desired_tx, pipeline, .. } = self;
        let _ = desired_tx.send(PipelineState::Paused);
        drop(desired_tx);
        if let Some(pipeline) = pipeline {
            match pipeline.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::error!(error = ?err, "duplication pipeline exited with error"),
                Err(err) => tracing::error!(error = ?err, "error joining duplication pipeline task"),
            }
        }
        tracing::debug!("closing duplication {}", description);
        Ok(())
    }

    /// Handle a duplication controller message.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<DuplicationCtlMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                self.descheduled = true;
                return;
            }
        };
        match msg {
            DuplicationCtlMsg::UpdateDescriptor(descriptor) => self.handle_descriptor_update(descriptor),
            DuplicationCtlMsg::PipelineFailed(err) => self.handle_pipeline_failed(err),
        }
    }

    /// Handle an updated task descriptor from the metadata service.
    #[tracing::instrument(level = "trace", skip(self, descriptor))]
    fn handle_descriptor_update(&mut self, descriptor: DuplicationDescriptor) {
        if descriptor.id != self.id {
            tracing::warn!(dupid = descriptor.id, "dropping descriptor update bound for a different duplication task");
            return;
        }
        if let Some(&confirmed_decree) = descriptor.progress.get(&self.replica.gpid().partition) {
            let progress = DuplicationProgress { last_decree: confirmed_decree, confirmed_decree };
            if let Err(err) = self.update_progress(progress) {
                tracing::error!(error = ?err, "fatal error merging descriptor progress, shutting down");
                let _ = self.shutdown_tx.send(());
                return;
            }
        }
        self.update_status_if_needed(descriptor.status);
    }

    /// Handle a pipeline failure: the task can no longer make progress on its own, so it
    /// is paused and left visible to the operator/metadata service via its status.
    #[tracing::instrument(level = "trace", skip(self, err))]
    fn handle_pipeline_failed(&mut self, err: anyhow::Error) {
        tracing::error!(error = ?err, "duplication pipeline failed, pausing task {}", self.id);
        let _ = self.status_tx.send(DuplicationStatus::Paused);
        self.pause();
    }

    /// Transition the task between the running and paused statuses.
    ///
    /// These are the only two statuses which ever reach this layer; the descriptor type
    /// makes any other value unrepresentable.
    pub fn update_status_if_needed(&mut self, next_status: DuplicationStatus) {
        if *self.status_tx.borrow() == next_status {
            return;
        }
        let _ = self.status_tx.send(next_status);
        match next_status {
            DuplicationStatus::Running => self.start(),
            DuplicationStatus::Paused => {
                tracing::info!("pausing duplication: {}", self.describe());
                self.pause();
            }
        }
    }

    /// (Re)enter the running pipeline; idempotent when already running.
    pub fn start(&self) {
        if *self.desired_tx.borrow() == PipelineState::Running {
            tracing::debug!("duplication {} is already running", self.id);
            return;
        }
        let progress = self.progress.get();
        let max_gced_decree = match self.replica.log().max_gced_decree() {
            Ok(decree) => decree,
            Err(err) => {
                tracing::warn!(error = ?err, "error reading max gced decree while starting duplication");
                0
            }
        };
        tracing::info!(
            last_decree = progress.last_decree,
            confirmed_decree = progress.confirmed_decree,
            max_gced_decree,
            "starting duplication {}",
            self.describe()
        );
        let _ = self.desired_tx.send(PipelineState::Running);
    }

    /// Stop the pipeline cycle; in-flight stage work drains, nothing new starts.
    fn pause(&self) {
        let _ = self.desired_tx.send(PipelineState::Paused);
    }

    /// Merge an externally observed progress into the task's tracked state.
    pub fn update_progress(&self, progress: DuplicationProgress) -> ShutdownResult<()> {
        self.progress.update(progress)
    }

    /// A point-in-time snapshot of the task's progress watermarks.
    pub fn progress(&self) -> DuplicationProgress {
        self.progress.get()
    }

    /// Check that the private log still holds all data needed to duplicate from the
    /// given decree onward.
    pub fn verify_start_decree(&self, start_decree: Decree) -> Result<()> {
        verify_start_decree(&self.progress, &self.replica.log(), start_decree)
    }

    /// A structured status snapshot of this task.
    pub fn snapshot(&self) -> DuplicationStatusSnapshot {
        DuplicationStatusSnapshot {
            dupid: self.id,
            status: *self.status_tx.borrow(),
            remote: self.remote_address.clone(),
            confirmed: self.progress.get().confirmed_decree,
            app: self.replica.app_name().to_string(),
        }
    }

    /// Serialize this task's status snapshot for diagnostics.
    pub fn describe(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|err| {
            tracing::error!(error = ?err, "error serializing duplication status snapshot");
            String::new()
        })
    }

    /// Recompute the task's derived metrics; best effort, never blocks the pipeline.
    fn update_metrics(&mut self) {
        let progress = self.progress.get();
        let pending = self.replica.last_committed_decree().saturating_sub(progress.confirmed_decree);
        metrics::gauge!(METRIC_DUP_PENDING, pending as f64);
        metrics::gauge!(
            METRIC_DUP_CONFIRMED_DELTA,
            progress.confirmed_decree.saturating_sub(self.last_recorded_confirmed_decree) as f64
        );
        self.last_recorded_confirmed_decree = progress.confirmed_decree;
    }
}

/// A message bound for a duplication controller.
pub enum DuplicationCtlMsg {
    /// An updated task descriptor from the metadata service.
    UpdateDescriptor(DuplicationDescriptor),
    /// The pipeline has hit an unrecoverable failure and exited.
    PipelineFailed(anyhow::Error),
}

/// A handle to a live duplication controller.
#[derive(Clone)]
pub struct DuplicationHandle {
    /// The task's ID.
    pub id: u64,
    /// The controller's communication channel.
    pub tx: mpsc::Sender<DuplicationCtlMsg>,
    /// The task's progress watermarks.
    progress: Arc<SharedProgress>,
    /// The task's status.
    status: watch::Receiver<DuplicationStatus>,
}

impl DuplicationHandle {
    /// A point-in-time snapshot of the task's progress watermarks.
    pub fn progress(&self) -> DuplicationProgress {
        self.progress.get()
    }

    /// The task's current status.
    pub fn status(&self) -> DuplicationStatus {
        *self.status.borrow()
    }
}
