//! Cluster metadata service interfaces.
//!
//! The metadata service owns authoritative partition configuration and app metadata; this
//! layer only drives it through the narrow request/response surface below.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::primitives::{Ballot, Decree, DuplicationStatus, Gpid};

/// A request to register a newly caught-up split child as a servable partition.
#[derive(Clone, Debug)]
pub struct RegisterChildRequest {
    /// The identity of the parent partition driving the split.
    pub parent: Gpid,
    /// The identity of the child partition to register.
    pub child: Gpid,
    /// The parent's current ballot; a stale ballot causes rejection.
    pub ballot: Ballot,
}

/// A successful register-child response.
#[derive(Clone, Debug)]
pub struct RegisterChildResponse {
    /// The new routable partition count of the app.
    pub partition_count: u32,
    /// The partition configuration published for the child.
    pub config: PartitionConfig,
}

/// A partition configuration published by the metadata service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionConfig {
    /// The partition named by this configuration.
    pub gpid: Gpid,
    /// The ballot under which the configuration was published.
    pub ballot: Ballot,
    /// The routable partition count of the owning app.
    pub partition_count: u32,
}

/// A client of the cluster metadata service.
#[async_trait]
pub trait MetaClient: Send + Sync + 'static {
    /// Register a split child, returning the new partition configuration on success.
    ///
    /// Rejections and transport failures are expected operational conditions; the caller
    /// abandons the split attempt and may retry it from scratch later.
    async fn register_child(&self, request: RegisterChildRequest) -> Result<RegisterChildResponse>;
}

/// A duplication task descriptor, delivered at assignment and on status changes.
#[derive(Clone, Debug)]
pub struct DuplicationDescriptor {
    /// The unique ID of the duplication task.
    pub id: u64,
    /// The address of the remote cluster receiving duplicated mutations.
    pub remote: String,
    /// The task's status.
    pub status: DuplicationStatus,
    /// The confirmed decree per partition, as known by the metadata service.
    pub progress: HashMap<u32, Decree>,
}
