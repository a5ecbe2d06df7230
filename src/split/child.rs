//! Child-side partition split controller.
//!
//! A split child is spawned by its parent with a transferred checkpoint, a private-log
//! segment and the parent's in-memory mutation window. It rebuilds the parent's state in
//! strict decree order, catches up on the writes the parent keeps forwarding, notifies
//! the parent once it reaches the parent's frontier, and then waits for the metadata
//! service (via the parent) to publish a partition configuration naming it servable.
//!
//! Any validation or replay failure is fatal to the child alone: it terminates itself
//! and the parent independently resets its own split context, so the two sides never
//! need a joint abort handshake.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::meta::PartitionConfig;
use crate::primitives::{Ballot, Decree, Gpid, Mutation, ReplicaStatus};
use crate::replica::{CheckpointState, Replica};
use crate::split::SplitCtlMsg;

/// How long the child waits for the parent's reply to one catch-up notification.
const CATCH_UP_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// The delay between catch-up notification attempts.
const CATCH_UP_NOTIFY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The build-up phases of a split child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildPhase {
    /// Applying the transferred checkpoint.
    Initializing,
    /// Replaying the transferred log segment & mutation window in decree order.
    ApplyingLog,
    /// Applying mutations forwarded by the parent during replay.
    CatchingUp,
    /// Notifying the parent that the local decree has reached the parent's frontier.
    NotifyingParent,
    /// Waiting for a published partition configuration naming this child.
    AwaitingActivation,
    /// The child is registered and servable.
    Active,
}

/// The state transferred from a parent to its split child.
pub struct ChildTransfer {
    /// The parent's latest durable checkpoint.
    pub checkpoint: CheckpointState,
    /// Committed mutations from the parent's private log beyond the checkpoint.
    pub log_segment: Vec<Mutation>,
    /// The parent's in-memory recent-mutation window at capture time.
    pub mutation_window: Vec<Mutation>,
    /// The parent's last committed decree at capture time; the replay upper bound.
    pub parent_last_committed: Decree,
    /// The parent's ballot when the split started.
    pub init_ballot: Ballot,
    /// The identity of the parent partition.
    pub parent_gpid: Gpid,
}

/// A controller driving one split child from creation through activation.
pub struct ChildCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The child's own replica.
    replica: Replica,
    /// The state transferred from the parent.
    transfer: ChildTransfer,

    /// Mutations forwarded by the parent during the catch-up window.
    forward_rx: mpsc::Receiver<Mutation>,
    /// The activation configuration published via the parent.
    activation_rx: watch::Receiver<Option<PartitionConfig>>,
    /// A channel to the parent's split controller.
    parent_tx: mpsc::Sender<SplitCtlMsg>,
    /// The child's current phase, observable by the parent & diagnostics.
    phase_tx: watch::Sender<ChildPhase>,
    /// A bool indicating the parent's forward channel has closed.
    forward_open: bool,
}

impl ChildCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, replica: Replica, transfer: ChildTransfer, forward_rx: mpsc::Receiver<Mutation>,
        activation_rx: watch::Receiver<Option<PartitionConfig>>, parent_tx: mpsc::Sender<SplitCtlMsg>,
    ) -> (Self, watch::Receiver<ChildPhase>) {
        let (phase_tx, phase_rx) = watch::channel(ChildPhase::Initializing);
        (
            Self {
                config,
                replica,
                transfer,
                forward_rx,
                activation_rx,
                parent_tx,
                phase_tx,
                forward_open: true,
            },
            phase_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("split child controller {} has started", self.replica.gpid());
        match self.try_run().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.handle_split_error(&err);
                Err(err)
            }
        }
    }

    async fn try_run(&mut self) -> Result<()> {
        self.apply_checkpoint().await?;

        self.set_phase(ChildPhase::ApplyingLog);
        self.replay_transferred_mutations().await?;

        self.set_phase(ChildPhase::CatchingUp);
        self.drain_forwarded_mutations().await?;

        self.set_phase(ChildPhase::NotifyingParent);
        self.notify_parent().await?;

        self.set_phase(ChildPhase::AwaitingActivation);
        self.await_activation().await?;

        self.set_phase(ChildPhase::Active);
        tracing::info!(
            last_committed_decree = self.replica.last_committed_decree(),
            "split child {} is active",
            self.replica.gpid()
        );
        Ok(())
    }

    fn set_phase(&self, phase: ChildPhase) {
        let _ = self.phase_tx.send(phase);
    }

    /// Tear down on any local validation or replay failure.
    fn handle_split_error(&self, err: &anyhow::Error) {
        tracing::error!(error = ?err, "split child {} failed, terminating", self.replica.gpid());
        self.replica.set_status(ReplicaStatus::Error);
    }

    /// Install the parent's transferred checkpoint as this replica's applied state.
    async fn apply_checkpoint(&mut self) -> Result<()> {
        let checkpoint = CheckpointState {
            last_committed_decree: self.transfer.checkpoint.last_committed_decree,
            entries: std::mem::take(&mut self.transfer.checkpoint.entries),
        };
        tracing::debug!(
            checkpoint_decree = checkpoint.last_committed_decree,
            "split child {} installing transferred checkpoint",
            self.replica.gpid()
        );
        self.replica.install_checkpoint(checkpoint).await.context("error installing transferred checkpoint")
    }

    /// Replay the transferred log segment & mutation window in strict decree order, up to
    /// the parent's last committed decree at capture time.
    async fn replay_transferred_mutations(&mut self) -> Result<()> {
        let mut mutations = BTreeMap::new();
        for mutation in self.transfer.log_segment.drain(..).chain(self.transfer.mutation_window.drain(..)) {
            mutations.insert(mutation.decree, mutation);
        }

        let (from, through) = (self.replica.last_committed_decree() + 1, self.transfer.parent_last_committed);
        for decree in from..=through {
            let mutation = mutations
                .remove(&decree)
                .with_context(|| format!("transferred state is missing the mutation at decree {}", decree))?;
            if mutation.ballot > self.transfer.init_ballot {
                bail!(
                    "transferred mutation at decree {} carries ballot {} beyond the split ballot {}",
                    decree,
                    mutation.ballot,
                    self.transfer.init_ballot
                );
            }
            self.replica.apply(mutation).await?;
        }
        tracing::debug!(
            last_committed_decree = self.replica.last_committed_decree(),
            "split child {} finished replaying transferred state",
            self.replica.gpid()
        );
        Ok(())
    }

    /// Apply any forwarded mutations which accumulated while replay was running.
    async fn drain_forwarded_mutations(&mut self) -> Result<()> {
        while let Ok(mutation) = self.forward_rx.try_recv() {
            self.apply_forwarded(mutation).await?;
        }
        Ok(())
    }

    /// Apply one mutation forwarded by the parent during the catch-up window.
    async fn apply_forwarded(&mut self, mutation: Mutation) -> Result<()> {
        if mutation.decree <= self.replica.last_committed_decree() {
            return Ok(());
        }
        if mutation.ballot != self.transfer.init_ballot {
            bail!(
                "forwarded mutation at decree {} carries ballot {}, split ballot is {}",
                mutation.decree,
                mutation.ballot,
                self.transfer.init_ballot
            );
        }
        self.replica.apply(mutation).await
    }

    /// Notify the parent that this child has caught up, retrying a bounded number of
    /// times when no reply arrives in time.
    async fn notify_parent(&mut self) -> Result<()> {
        let attempts = self.config.catch_up_notify_attempts.max(1);
        for attempt in 1..=attempts {
            let (tx, rx) = oneshot::channel();
            let msg = SplitCtlMsg::ChildCaughtUp {
                child_gpid: self.replica.gpid(),
                child_ballot: self.replica.ballot(),
                tx,
            };
            if self.parent_tx.send(msg).await.is_err() {
                bail!("parent controller is gone, cannot deliver catch-up notification");
            }
            match tokio::time::timeout(CATCH_UP_NOTIFY_TIMEOUT, rx).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!("split child {} catch-up acknowledged by parent", self.replica.gpid());
                    return Ok(());
                }
                Ok(Ok(Err(err))) => return Err(err).context("catch-up notification rejected by parent"),
                Ok(Err(_closed)) => bail!("parent discarded the split before acknowledging catch-up"),
                Err(_elapsed) => {
                    tracing::warn!(attempt, "timeout awaiting catch-up acknowledgment from parent, will retry");
                    tokio::time::sleep(CATCH_UP_NOTIFY_RETRY_DELAY).await;
                }
            }
        }
        bail!("no catch-up acknowledgment from parent after {} attempts", attempts);
    }

    /// Wait for the partition configuration naming this child, applying any mutations the
    /// parent continues to forward in the meantime.
    async fn await_activation(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                res = self.activation_rx.changed() => {
                    if res.is_err() {
                        bail!("parent abandoned the split before activation");
                    }
                    let config_opt = self.activation_rx.borrow().clone();
                    if let Some(config) = config_opt {
                        if config.gpid != self.replica.gpid() {
                            bail!("activation configuration names partition {}, expected {}", config.gpid, self.replica.gpid());
                        }
                        self.replica.set_partition_count(config.partition_count);
                        self.replica.partition_version().set_from_count(config.partition_count);
                        self.replica.set_status(ReplicaStatus::Secondary);
                        return Ok(());
                    }
                }
                mutation_opt = self.forward_rx.recv(), if self.forward_open => match mutation_opt {
                    Some(mutation) => self.apply_forwarded(mutation).await?,
                    None => self.forward_open = false,
                },
            }
        }
    }
}
