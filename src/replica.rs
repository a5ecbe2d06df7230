//! The owning replica's capability surface.
//!
//! The split & duplication coordinators are each attached 1:1 to an owning replica. They
//! interact with it exclusively through the narrow accessor/mutator surface below, which
//! keeps the coupling auditable. Ballot and status are always read through the accessors
//! at the point of use; callers must not cache either across a suspension point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use crate::config::Config;
use crate::database::{Database, Tree};
use crate::error::{ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::log::MutationLog;
use crate::primitives::{Ballot, Decree, Gpid, Mutation, PartitionVersion, ReplicaStatus};
use crate::utils;

/// The key prefix used for storing applied state entries.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always
/// use the `utils::encode_byte_prefix` method.
pub const PREFIX_STATE_ENTRY: &[u8; 1] = b"s";

/// The capacity of the in-memory recent-mutation window.
const PREPARE_WINDOW_CAPACITY: usize = 128;

/// A transferable checkpoint of a replica's applied state.
#[derive(Clone, Debug)]
pub struct CheckpointState {
    /// The replica's last committed decree at the time the checkpoint was generated.
    pub last_committed_decree: Decree,
    /// The raw applied-state entries covered by the checkpoint.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A handle to one partition replica instance.
///
/// Cheap to clone; all clones observe a single consistently ordered view of ballot,
/// status and committed decree.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

struct ReplicaInner {
    gpid: Gpid,
    app_name: String,
    status: RwLock<ReplicaStatus>,
    ballot: AtomicU64,
    partition_count: AtomicU32,
    partition_version: PartitionVersion,
    last_committed: AtomicU64,
    checkpoint_decree: AtomicU64,
    log: MutationLog,
    state: Tree,
    window: Mutex<VecDeque<Mutation>>,
    commit_tx: watch::Sender<Decree>,
    ballot_tx: watch::Sender<Ballot>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Replica {
    /// Create a new replica handle, opening its private log & applied-state storage.
    pub async fn new(config: Arc<Config>, db: &Database, gpid: Gpid, partition_count: u32, status: ReplicaStatus, ballot: Ballot) -> Result<Self> {
        let log = MutationLog::open(db, gpid).await?;
        let state = db.get_state_tree(gpid).await?;
        let (commit_tx, _commit_rx) = watch::channel(0);
        let (ballot_tx, _ballot_rx) = watch::channel(ballot);
        Ok(Self {
            inner: Arc::new(ReplicaInner {
                gpid,
                app_name: config.app_name.clone(),
                status: RwLock::new(status),
                ballot: AtomicU64::new(ballot),
                partition_count: AtomicU32::new(partition_count),
                partition_version: PartitionVersion::new(partition_count),
                last_committed: AtomicU64::new(0),
                checkpoint_decree: AtomicU64::new(0),
                log,
                state,
                window: Mutex::new(VecDeque::with_capacity(PREPARE_WINDOW_CAPACITY)),
                commit_tx,
                ballot_tx,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// The identity of this partition.
    pub fn gpid(&self) -> Gpid {
        self.inner.gpid
    }

    /// The name of the application to which this replica belongs.
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// The replica's current serving status.
    pub fn status(&self) -> ReplicaStatus {
        *self.inner.status.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update the replica's serving status.
    pub fn set_status(&self, status: ReplicaStatus) {
        *self.inner.status.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    /// The replica's current ballot.
    pub fn ballot(&self) -> Ballot {
        self.inner.ballot.load(Ordering::SeqCst)
    }

    /// Advance the replica's ballot following an election event.
    ///
    /// The ballot never decreases for a live replica; a stale value is rejected.
    pub fn advance_ballot(&self, ballot: Ballot) -> Result<()> {
        let current = self.ballot();
        if ballot < current {
            bail!("ballot may not decrease [current: {}, requested: {}]", current, ballot);
        }
        if ballot > current {
            self.inner.ballot.store(ballot, Ordering::SeqCst);
            let _ = self.inner.ballot_tx.send(ballot);
        }
        Ok(())
    }

    /// A signal of ballot changes, seeded with the current ballot.
    pub fn ballot_signal(&self) -> watch::Receiver<Ballot> {
        self.inner.ballot_tx.subscribe()
    }

    /// The replica's last committed decree.
    pub fn last_committed_decree(&self) -> Decree {
        self.inner.last_committed.load(Ordering::SeqCst)
    }

    /// A signal of the replica's last committed decree.
    pub fn commit_signal(&self) -> watch::Receiver<Decree> {
        self.inner.commit_tx.subscribe()
    }

    /// The current routable partition count of the owning application.
    pub fn partition_count(&self) -> u32 {
        self.inner.partition_count.load(Ordering::SeqCst)
    }

    /// Commit a new routable partition count following successful child registration.
    pub fn set_partition_count(&self, partition_count: u32) {
        self.inner.partition_count.store(partition_count, Ordering::SeqCst);
    }

    /// The owner of this partition's routable version scalar.
    pub fn partition_version(&self) -> &PartitionVersion {
        &self.inner.partition_version
    }

    /// A handle to this replica's private log.
    pub fn log(&self) -> MutationLog {
        self.inner.log.clone()
    }

    /// A snapshot of the in-memory recent-mutation window, ordered by decree.
    pub fn prepare_window(&self) -> Vec<Mutation> {
        let window = self.inner.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.iter().cloned().collect()
    }

    /// Commit a new mutation under the current ballot, assigning it the next decree.
    pub async fn commit(&self, payload: Vec<u8>) -> Result<Decree> {
        let _guard = self.inner.write_lock.lock().await;
        let decree = self.last_committed_decree() + 1;
        let mutation = Mutation { decree, ballot: self.ballot(), payload };
        self.apply_inner(mutation).await?;
        Ok(decree)
    }

    /// Apply an externally ordered committed mutation.
    ///
    /// The mutation's decree must directly follow the last committed decree; the log
    /// admits no gaps after apply.
    pub async fn apply(&self, mutation: Mutation) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let expected = self.last_committed_decree() + 1;
        if mutation.decree != expected {
            bail!("mutation decree {} does not follow last committed decree {}", mutation.decree, expected - 1);
        }
        self.apply_inner(mutation).await
    }

    async fn apply_inner(&self, mutation: Mutation) -> Result<()> {
        self.inner.log.append(std::slice::from_ref(&mutation)).await?;
        let (state, key, payload) = (
            self.inner.state.clone(),
            utils::encode_byte_prefix(PREFIX_STATE_ENTRY, mutation.decree),
            mutation.payload.clone(),
        );
        Database::spawn_blocking(move || -> Result<()> {
            state.insert(&key, payload).context("error applying mutation to state storage")?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)?;

        {
            let mut window = self.inner.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if window.len() >= PREPARE_WINDOW_CAPACITY {
                window.pop_front();
            }
            window.push_back(mutation.clone());
        }
        self.inner.last_committed.store(mutation.decree, Ordering::SeqCst);
        let _ = self.inner.commit_tx.send(mutation.decree);
        Ok(())
    }

    /// Record that a durable checkpoint now covers state up through the given decree.
    pub fn mark_checkpoint(&self, decree: Decree) -> Result<()> {
        let last_committed = self.last_committed_decree();
        if decree > last_committed {
            bail!("checkpoint decree {} is beyond last committed decree {}", decree, last_committed);
        }
        self.inner.checkpoint_decree.store(decree, Ordering::SeqCst);
        Ok(())
    }

    /// Capture the latest durable checkpoint into a transferable form.
    pub async fn capture_checkpoint(&self) -> Result<CheckpointState> {
        let through = self.inner.checkpoint_decree.load(Ordering::SeqCst);
        let state = self.inner.state.clone();
        Database::spawn_blocking(move || -> Result<CheckpointState> {
            let start = utils::encode_byte_prefix(PREFIX_STATE_ENTRY, 0);
            let stop = utils::encode_byte_prefix(PREFIX_STATE_ENTRY, through);
            let mut entries = Vec::new();
            for kv_res in state.range::<_, std::ops::RangeInclusive<&[u8]>>(&start[..]..=&stop[..]) {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                entries.push((key.to_vec(), val.to_vec()));
            }
            Ok(CheckpointState { last_committed_decree: through, entries })
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)
    }

    /// Install a transferred checkpoint, replacing this replica's applied state.
    pub async fn install_checkpoint(&self, checkpoint: CheckpointState) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let state = self.inner.state.clone();
        let last_committed = checkpoint.last_committed_decree;
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            for (key, val) in checkpoint.entries {
                batch.insert(key, val);
            }
            state.apply_batch(batch).context("error installing checkpoint state")?;
            state.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)?;
        self.inner.checkpoint_decree.store(last_committed, Ordering::SeqCst);
        self.inner.last_committed.store(last_committed, Ordering::SeqCst);
        let _ = self.inner.commit_tx.send(last_committed);
        Ok(())
    }
}
