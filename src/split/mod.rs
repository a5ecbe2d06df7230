//! Partition split controller.
//!
//! An online split grows an app's partition count without downtime: a parent partition
//! spawns a child, transfers its checkpoint, log segment and in-memory mutation window,
//! keeps serving (and mirroring new writes to the child) while the child replays, and
//! registers the child with the metadata service only once the child has explicitly
//! confirmed catch-up. The ballot recorded when the split starts is checked before every
//! externally observable transition; if it moves, the primary role may have moved with
//! it, consistency can no longer be guaranteed, and the attempt is discarded wholesale.
//! Split attempts fail closed: serving continues under the old partition count.

mod child;

use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::database::Database;
use crate::error::SplitError;
use crate::meta::{MetaClient, PartitionConfig, RegisterChildRequest, RegisterChildResponse};
use crate::primitives::{Ballot, Decree, Gpid, Mutation, ReplicaStatus};
use crate::replica::Replica;
pub use self::child::{ChildCtl, ChildPhase, ChildTransfer};

/// The capacity of the parent-to-child forwarded-mutation channel.
const FORWARD_CHANNEL_CAPACITY: usize = 1024;

/// The parent-side phases of one split attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitPhase {
    /// No split is in progress.
    Idle,
    /// Capturing transferable state & spawning the child replica.
    PreparingChild,
    /// Serving while the child replays & catches up.
    WaitingCatchUp,
    /// Register-child request in flight to the metadata service.
    Registering,
}

/// An observable snapshot of the parent's split context.
#[derive(Clone)]
pub struct SplitContext {
    /// The current parent-side phase.
    pub phase: SplitPhase,
    /// The child partition identity; the null identity when no split is active.
    pub child_gpid: Gpid,
    /// The ballot recorded when the split started; `0` when no split is active.
    pub init_ballot: Ballot,
    /// The child controller's phase signal, while a child is attached.
    pub child_phase: Option<watch::Receiver<ChildPhase>>,
}

/// Handles to a live child controller.
struct ChildHandles {
    /// The channel of mutations mirrored to the child during catch-up.
    forward_tx: mpsc::Sender<Mutation>,
    /// The channel publishing the child's activation configuration.
    activation_tx: watch::Sender<Option<PartitionConfig>>,
    /// The child controller's phase signal.
    phase: watch::Receiver<ChildPhase>,
    /// The join handle of the child controller.
    _handle: JoinHandle<Result<()>>,
}

/// A controller encapsulating all logic for driving a partition through an online split.
pub struct SplitCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    db: Database,
    /// The parent replica.
    replica: Replica,
    /// The cluster metadata service client.
    meta: Arc<dyn MetaClient>,

    /// The current parent-side phase.
    phase: SplitPhase,
    /// The child partition identity; the null identity when no split is active.
    child_gpid: Gpid,
    /// The ballot recorded when the split started; `0` when no split is active.
    child_init_ballot: Ballot,
    /// The first decree sent synchronously to both parent & child after the transfer
    /// started; its commit marks the child-visible state as caught up.
    sync_point: Decree,
    /// The partition version observed before the split started, restored on failure.
    prev_partition_version: i32,
    /// The highest decree already mirrored to the child.
    last_forwarded: Decree,
    /// A deferred catch-up acknowledgment, held until the sync point commits.
    pending_catch_up: Option<oneshot::Sender<Result<(), SplitError>>>,
    /// Handles to the live child controller, while a split is active.
    child: Option<ChildHandles>,

    /// The observable split context.
    context_tx: watch::Sender<SplitContext>,
    /// A channel of events to be processed by this controller.
    events_tx: mpsc::Sender<SplitCtlMsg>,
    /// A channel of events to be processed by this controller.
    events_rx: ReceiverStream<SplitCtlMsg>,
    /// A signal of the parent replica's last committed decree.
    commit_signal: WatchStream<Decree>,
    /// A signal of the parent replica's ballot.
    ballot_signal: WatchStream<Ballot>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl SplitCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, db: Database, replica: Replica, meta: Arc<dyn MetaClient>, shutdown_tx: broadcast::Sender<()>,
        events_tx: mpsc::Sender<SplitCtlMsg>, events_rx: mpsc::Receiver<SplitCtlMsg>,
    ) -> (Self, watch::Receiver<SplitContext>) {
        let (context_tx, context_rx) = watch::channel(SplitContext {
            phase: SplitPhase::Idle,
            child_gpid: Gpid::NULL,
            init_ballot: 0,
            child_phase: None,
        });
        let commit_signal = WatchStream::new(replica.commit_signal());
        let ballot_signal = WatchStream::new(replica.ballot_signal());
        (
            Self {
                config,
                db,
                replica,
                meta,
                phase: SplitPhase::Idle,
                child_gpid: Gpid::NULL,
                child_init_ballot: 0,
                sync_point: 0,
                prev_partition_version: 0,
                last_forwarded: 0,
                pending_catch_up: None,
                child: None,
                context_tx,
                events_tx,
                events_rx: ReceiverStream::new(events_rx),
                commit_signal,
                ballot_signal,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                descheduled: false,
            },
            context_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("split controller {}/{} has started", self.config.app_name, self.config.partition);

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => self.handle_msg(msg_opt).await,
                Some(decree) = self.commit_signal.next() => self.handle_commit(decree).await,
                Some(ballot) = self.ballot_signal.next() => self.handle_ballot_change(ballot),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("split controller {}/{} has shutdown", self.config.app_name, self.config.partition);
        Ok(())
    }

    /// Handle a split controller message.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<SplitCtlMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                self.descheduled = true;
                return;
            }
        };
        match msg {
            SplitCtlMsg::AddChild { child_gpid } => self.handle_add_child(child_gpid).await,
            SplitCtlMsg::ChildCaughtUp { child_gpid, child_ballot, tx } => self.handle_child_catch_up(child_gpid, child_ballot, tx),
            SplitCtlMsg::RegisterReply(res) => self.handle_register_reply(res),
        }
    }

    /// Handle a group-check instruction naming a new child partition.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_add_child(&mut self, child_gpid: Gpid) {
        if self.replica.status() != ReplicaStatus::Primary {
            tracing::warn!(status = ?self.replica.status(), "ignoring add-child instruction, replica is not primary");
            return;
        }
        if self.phase != SplitPhase::Idle {
            if child_gpid == self.child_gpid {
                tracing::debug!("child {} is already under split, ignoring duplicate instruction", child_gpid);
            } else {
                tracing::warn!("split already in progress for {}, ignoring instruction for {}", self.child_gpid, child_gpid);
            }
            return;
        }
        let expected = self.replica.gpid().child(self.replica.partition_count());
        if child_gpid != expected {
            tracing::warn!("unexpected child partition {}, expected {}, ignoring instruction", child_gpid, expected);
            return;
        }

        self.phase = SplitPhase::PreparingChild;
        self.child_gpid = child_gpid;
        self.child_init_ballot = self.replica.ballot();
        self.prev_partition_version = self.replica.partition_version().get();
        self.publish_context();
        tracing::info!(
            ballot = self.child_init_ballot,
            "starting partition split {} -> {}",
            self.replica.gpid(),
            child_gpid
        );

        if let Err(err) = self.parent_prepare_states(child_gpid).await {
            tracing::error!(error = ?err, "error preparing split states, abandoning split");
            self.cleanup_split_context();
            return;
        }

        // Define the sync point: the first decree sent to both parent & child
        // synchronously after the transfer started.
        match self.replica.commit(Vec::new()).await {
            Ok(decree) => self.sync_point = decree,
            Err(err) => {
                tracing::error!(error = ?err, "error committing split sync-point marker, abandoning split");
                self.cleanup_split_context();
                return;
            }
        }
        self.phase = SplitPhase::WaitingCatchUp;
        self.publish_context();
        tracing::debug!(sync_point = self.sync_point, "split state transfer dispatched to child {}", self.child_gpid);
    }

    /// Capture the parent's transferable state & spawn the child replica with it.
    async fn parent_prepare_states(&mut self, child_gpid: Gpid) -> Result<()> {
        let checkpoint = self.replica.capture_checkpoint().await?;
        let frontier = self.replica.last_committed_decree();
        let log_segment = self
            .replica
            .log()
            .read_range(checkpoint.last_committed_decree + 1, frontier, usize::MAX)
            .await?;
        let mutation_window = self.replica.prepare_window();

        let child_replica = Replica::new(
            self.config.clone(),
            &self.db,
            child_gpid,
            self.replica.partition_count(),
            ReplicaStatus::Inactive,
            self.child_init_ballot,
        )
        .await?;
        let (forward_tx, forward_rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);
        let (activation_tx, activation_rx) = watch::channel(None);
        let transfer = ChildTransfer {
            log_segment,
            mutation_window,
            parent_last_committed: frontier,
            init_ballot: self.child_init_ballot,
            parent_gpid: self.replica.gpid(),
            checkpoint,
        };
        tracing::info!(
            checkpoint_decree = transfer.checkpoint.last_committed_decree,
            log_segment_len = transfer.log_segment.len(),
            window_len = transfer.mutation_window.len(),
            frontier,
            "transferring parent states to child {}",
            child_gpid
        );

        let (child_ctl, phase_rx) = ChildCtl::new(self.config.clone(), child_replica, transfer, forward_rx, activation_rx, self.events_tx.clone());
        let handle = child_ctl.spawn();
        self.child = Some(ChildHandles {
            forward_tx,
            activation_tx,
            phase: phase_rx,
            _handle: handle,
        });
        self.last_forwarded = frontier;
        Ok(())
    }

    /// Handle a committed decree: mirror new writes to the child & check the sync point.
    #[tracing::instrument(level = "trace", skip(self, decree))]
    async fn handle_commit(&mut self, decree: Decree) {
        if self.phase == SplitPhase::Idle || self.child.is_none() {
            return;
        }
        if self.replica.ballot() != self.child_init_ballot {
            self.cleanup_split_context();
            return;
        }
        if let Err(err) = self.forward_new_mutations(decree).await {
            // The child is unreachable; the attempt dies on its own through the absence
            // of a catch-up notification or a later ballot change.
            tracing::debug!(error = ?err, "error mirroring mutations to split child {}", self.child_gpid);
        }
        self.check_sync_point_commit();
    }

    /// Mirror all newly committed mutations up through the given decree to the child.
    async fn forward_new_mutations(&mut self, decree: Decree) -> Result<()> {
        let child = match self.child.as_ref() {
            Some(child) => child,
            None => return Ok(()),
        };
        while self.last_forwarded < decree {
            let from = self.last_forwarded + 1;
            let window = self.replica.prepare_window();
            let window_covers_from = window.first().map(|mutation| mutation.decree <= from).unwrap_or(false);
            let batch = if window_covers_from {
                window.into_iter().filter(|m| m.decree >= from && m.decree <= decree).collect()
            } else {
                self.replica.log().read_range(from, decree, usize::MAX).await?
            };
            if batch.is_empty() {
                return Ok(());
            }
            for mutation in batch {
                let forwarded = mutation.decree;
                child.forward_tx.send(mutation).await.map_err(|_| anyhow::anyhow!("split child forward channel closed"))?;
                self.last_forwarded = forwarded;
            }
        }
        Ok(())
    }

    /// Reply to a deferred catch-up notification once the sync point has committed, then
    /// move on to registration.
    fn check_sync_point_commit(&mut self) {
        if self.phase != SplitPhase::WaitingCatchUp || self.pending_catch_up.is_none() {
            return;
        }
        if self.replica.last_committed_decree() < self.sync_point {
            return;
        }
        if let Some(tx) = self.pending_catch_up.take() {
            let _ = tx.send(Ok(()));
        }
        self.register_child_on_meta();
    }

    /// Handle a catch-up notification from the child.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn handle_child_catch_up(&mut self, child_gpid: Gpid, child_ballot: Ballot, tx: oneshot::Sender<Result<(), SplitError>>) {
        match self.phase {
            SplitPhase::Idle | SplitPhase::PreparingChild => {
                let _ = tx.send(Err(SplitError::NoActiveSplit));
            }
            // Registration is already in flight; the earlier notification won.
            SplitPhase::Registering => {
                let _ = tx.send(Ok(()));
            }
            SplitPhase::WaitingCatchUp => {
                if child_gpid != self.child_gpid {
                    tracing::warn!("rejecting catch-up notification from unexpected child {}", child_gpid);
                    let _ = tx.send(Err(SplitError::NoActiveSplit));
                    return;
                }
                let current = self.replica.ballot();
                if self.child_init_ballot != current {
                    tracing::warn!(
                        recorded = self.child_init_ballot,
                        current,
                        "rejecting stale catch-up notification, ballot changed since split start"
                    );
                    let _ = tx.send(Err(SplitError::BallotChanged { recorded: self.child_init_ballot, current }));
                    self.cleanup_split_context();
                    return;
                }
                if child_ballot != current {
                    tracing::warn!(child_ballot, current, "rejecting catch-up notification carrying a stale ballot");
                    let _ = tx.send(Err(SplitError::BallotChanged { recorded: child_ballot, current }));
                    return;
                }
                tracing::info!("split child {} reports catch-up at ballot {}", child_gpid, child_ballot);
                self.pending_catch_up = Some(tx);
                self.check_sync_point_commit();
            }
        }
    }

    /// Issue the register-child request to the metadata service.
    fn register_child_on_meta(&mut self) {
        self.phase = SplitPhase::Registering;
        // Reject client requests while the routable partition count is in flux.
        self.replica.partition_version().reject_requests();
        self.publish_context();

        let request = RegisterChildRequest {
            parent: self.replica.gpid(),
            child: self.child_gpid,
            ballot: self.replica.ballot(),
        };
        tracing::info!(ballot = request.ballot, "registering split child {} on metadata service", self.child_gpid);
        let (meta, events_tx) = (self.meta.clone(), self.events_tx.clone());
        tokio::spawn(async move {
            let res = meta.register_child(request).await;
            let _ = events_tx.send(SplitCtlMsg::RegisterReply(res)).await;
        });
    }

    /// Handle the metadata service's reply to a register-child request.
    #[tracing::instrument(level = "trace", skip(self, res))]
    fn handle_register_reply(&mut self, res: Result<RegisterChildResponse>) {
        if self.phase != SplitPhase::Registering {
            tracing::debug!("dropping register-child reply, no registration in flight");
            return;
        }
        if self.replica.ballot() != self.child_init_ballot {
            self.cleanup_split_context();
            return;
        }
        match res {
            Ok(response) => {
                tracing::info!(
                    partition_count = response.partition_count,
                    "split child {} registered on metadata service",
                    self.child_gpid
                );
                self.replica.set_partition_count(response.partition_count);
                self.replica.partition_version().set_from_count(response.partition_count);
                if let Some(child) = self.child.as_ref() {
                    let _ = child.activation_tx.send(Some(response.config));
                }
                tracing::info!("partition split {} -> {} is complete", self.replica.gpid(), self.child_gpid);
                self.reset_split_context();
            }
            Err(err) => {
                tracing::warn!(error = ?err, "register-child request failed, abandoning split");
                self.cleanup_split_context();
            }
        }
    }

    /// Handle a ballot change observed on the parent replica.
    #[tracing::instrument(level = "trace", skip(self, ballot))]
    fn handle_ballot_change(&mut self, ballot: Ballot) {
        if self.phase == SplitPhase::Idle {
            return;
        }
        if ballot != self.child_init_ballot {
            tracing::warn!(
                recorded = self.child_init_ballot,
                current = ballot,
                "ballot changed during partition split, abandoning attempt"
            );
            self.cleanup_split_context();
        }
    }

    /// Discard the split context after a failed or invalidated attempt.
    ///
    /// Serving continues under the old partition count; the attempt may be retried from
    /// scratch later. The child, if still alive, detects the closed channels and
    /// terminates itself.
    fn cleanup_split_context(&mut self) {
        tracing::info!("discarding split context for child {}", self.child_gpid);
        self.replica.partition_version().set(self.prev_partition_version);
        if let Some(tx) = self.pending_catch_up.take() {
            let _ = tx.send(Err(SplitError::NoActiveSplit));
        }
        self.reset_split_context();
    }

    /// Reset the split context to its empty state.
    fn reset_split_context(&mut self) {
        self.phase = SplitPhase::Idle;
        self.child_gpid = Gpid::NULL;
        self.child_init_ballot = 0;
        self.sync_point = 0;
        self.last_forwarded = 0;
        self.pending_catch_up = None;
        self.child = None;
        self.publish_context();
    }

    /// Publish the current split context for observers.
    fn publish_context(&self) {
        let _ = self.context_tx.send(SplitContext {
            phase: self.phase,
            child_gpid: self.child_gpid,
            init_ballot: self.child_init_ballot,
            child_phase: self.child.as_ref().map(|child| child.phase.clone()),
        });
    }
}

/// A message bound for a split controller.
pub enum SplitCtlMsg {
    /// A group-check instruction naming a new child partition.
    AddChild {
        /// The identity of the child partition to create.
        child_gpid: Gpid,
    },
    /// A catch-up notification from the child.
    ChildCaughtUp {
        /// The identity of the notifying child.
        child_gpid: Gpid,
        /// The child's current ballot.
        child_ballot: Ballot,
        /// The response channel.
        tx: oneshot::Sender<Result<(), SplitError>>,
    },
    /// The metadata service's reply to a register-child request.
    RegisterReply(Result<RegisterChildResponse>),
}
