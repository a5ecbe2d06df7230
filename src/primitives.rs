//! Core replication primitives shared across the split & duplication controllers.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

/// A consensus epoch/term identifying who is authorized as primary for a partition's
/// replica group. Never decreases for a live replica.
pub type Ballot = u64;

/// A position in a partition's committed log, strictly increasing with no gaps after apply.
///
/// Decree numbering starts at `1`; `0` is the pre-write origin and also serves as the
/// "nothing garbage collected yet" value for the private log's GC watermark.
pub type Decree = u64;

/// The globally unique identity of one partition replica instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gpid {
    /// The ID of the owning application.
    pub app_id: u32,
    /// The partition index within the application.
    pub partition: u32,
}

impl Gpid {
    /// The null identity, used when no partition split is active.
    pub const NULL: Gpid = Gpid { app_id: 0, partition: 0 };

    /// Create a new partition identity.
    pub fn new(app_id: u32, partition: u32) -> Self {
        Self { app_id, partition }
    }

    /// Check if this is the null identity.
    pub fn is_null(&self) -> bool {
        self.app_id == 0
    }

    /// Derive the identity of this partition's split child.
    ///
    /// The child's partition index is `partition + old_partition_count`, which is where the
    /// child lands once the partition count grows.
    pub fn child(&self, old_partition_count: u32) -> Self {
        Self {
            app_id: self.app_id,
            partition: self.partition + old_partition_count,
        }
    }
}

impl fmt::Display for Gpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition)
    }
}

/// A committed log record, the unit shipped by duplication and replayed by a split child.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// The decree at which this mutation was committed.
    pub decree: Decree,
    /// The ballot under which this mutation was committed.
    pub ballot: Ballot,
    /// The opaque mutation payload.
    pub payload: Vec<u8>,
}

/// The serving status of a replica within its replica group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// The replica is the primary of its group.
    Primary,
    /// The replica is a secondary of its group.
    Secondary,
    /// The replica is not currently serving, e.g. a split child before activation.
    Inactive,
    /// The replica has hit an unrecoverable local error and must be torn down.
    Error,
}

/// The status of a duplication task.
///
/// Only these two states ever reach the duplication layer; all other lifecycle states are
/// resolved by the metadata service before task assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicationStatus {
    /// The task's pipeline is running.
    Running,
    /// The task's pipeline is paused.
    Paused,
}

impl fmt::Display for DuplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// The watermark pair tracked for one duplication task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DuplicationProgress {
    /// The highest decree read locally by the duplication pipeline.
    pub last_decree: Decree,
    /// The highest decree known to be durably received by the remote cluster.
    ///
    /// A value of `0` in an update means "no confirmation carried by this update"; see
    /// decree numbering above.
    pub confirmed_decree: Decree,
}

/// The value consulted by the request-serving path to reject reads/writes that would be
/// routed incorrectly while a split is structurally incomplete.
pub const PARTITION_VERSION_REJECT: i32 = -1;

/// Single owner of a partition's routable version scalar.
///
/// In normal operation the value is `partition_count - 1`; while a split is structurally
/// incomplete it is set to the out-of-range sentinel [`PARTITION_VERSION_REJECT`] so the
/// request path rejects traffic. Readers must re-read the value after any suspension
/// point rather than caching it.
pub struct PartitionVersion(AtomicI32);

impl PartitionVersion {
    /// Create a new instance for a partition of an app with the given partition count.
    pub fn new(partition_count: u32) -> Self {
        Self(AtomicI32::new(partition_count as i32 - 1))
    }

    /// Read the current partition version.
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Restore the version to a previously observed value.
    pub fn set(&self, version: i32) {
        self.0.store(version, Ordering::SeqCst);
    }

    /// Set the version from a new routable partition count.
    pub fn set_from_count(&self, partition_count: u32) {
        self.0.store(partition_count as i32 - 1, Ordering::SeqCst);
    }

    /// Set the out-of-range sentinel, causing the request path to reject traffic.
    pub fn reject_requests(&self) {
        self.0.store(PARTITION_VERSION_REJECT, Ordering::SeqCst);
    }
}
