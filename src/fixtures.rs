use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::database::Database;
use crate::duplication::RemoteSink;
use crate::meta::{DuplicationDescriptor, MetaClient, PartitionConfig, RegisterChildRequest, RegisterChildResponse};
use crate::primitives::{Ballot, Decree, DuplicationStatus, Gpid, Mutation, ReplicaStatus};
use crate::replica::Replica;

/// Wait up to five seconds for the given condition to hold.
pub async fn wait_for<F: Fn() -> bool>(cond: F, msg: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("timeout waiting for {}", msg);
}

/// Setup a primary replica for the given partition.
pub async fn setup_primary_replica(config: &Arc<Config>, db: &Database, gpid: Gpid, partition_count: u32, ballot: Ballot) -> Result<Replica> {
    Replica::new(config.clone(), db, gpid, partition_count, ReplicaStatus::Primary, ballot)
        .await
        .context("error creating test replica")
}

/// Commit `count` randomly sized mutations, returning the final committed decree.
pub async fn commit_mutations(replica: &Replica, count: usize) -> Result<Decree> {
    let mut last = replica.last_committed_decree();
    for _ in 0..count {
        let len = rand::thread_rng().gen_range(8..64);
        let payload: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
        last = replica.commit(payload).await?;
    }
    Ok(last)
}

/// Build a duplication descriptor carrying a progress entry for the given partition.
pub fn descriptor(id: u64, partition: u32, status: DuplicationStatus, confirmed_decree: Decree) -> DuplicationDescriptor {
    let mut progress = HashMap::new();
    progress.insert(partition, confirmed_decree);
    DuplicationDescriptor {
        id,
        remote: "helix-remote".into(),
        status,
        progress,
    }
}

/// A mock remote cluster sink which records every shipped batch.
pub struct MockRemote {
    /// Whether shipping must first acquire a permit from `permits`.
    gated: bool,
    /// Permits for gated shipping.
    permits: Semaphore,
    /// The number of upcoming ship calls which fail with a transient error.
    fail_remaining: AtomicU32,
    /// When non-zero, the next ship call acknowledges at most this decree.
    ack_cap_once: AtomicU64,
    /// The decrees of every shipped batch, in ship order.
    pub shipped: Mutex<Vec<Vec<Decree>>>,
}

impl MockRemote {
    /// A remote which acknowledges every batch immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gated: false,
            permits: Semaphore::new(0),
            fail_remaining: AtomicU32::new(0),
            ack_cap_once: AtomicU64::new(0),
            shipped: Mutex::new(Vec::new()),
        })
    }

    /// A remote which holds every ship call until a permit is released.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gated: true,
            permits: Semaphore::new(0),
            fail_remaining: AtomicU32::new(0),
            ack_cap_once: AtomicU64::new(0),
            shipped: Mutex::new(Vec::new()),
        })
    }

    /// Allow `n` gated ship calls through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Make the next `n` ship calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next ship call acknowledge at most the given decree.
    pub fn cap_next_ack(&self, decree: Decree) {
        self.ack_cap_once.store(decree, Ordering::SeqCst);
    }

    /// All shipped decrees, flattened in ship order.
    pub fn shipped_decrees(&self) -> Vec<Decree> {
        self.shipped.lock().unwrap().iter().flatten().copied().collect()
    }
}

#[async_trait]
impl RemoteSink for MockRemote {
    async fn ship(&self, _gpid: Gpid, batch: &[Mutation]) -> Result<Decree> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1))
            .is_ok()
        {
            bail!("transient remote failure");
        }
        if self.gated {
            let permit = self.permits.acquire().await.context("mock remote gate closed")?;
            permit.forget();
        }
        let decrees: Vec<_> = batch.iter().map(|mutation| mutation.decree).collect();
        let mut confirmed = decrees.last().copied().unwrap_or(0);
        let cap = self.ack_cap_once.swap(0, Ordering::SeqCst);
        if cap != 0 {
            confirmed = confirmed.min(cap);
        }
        self.shipped.lock().unwrap().push(decrees);
        Ok(confirmed)
    }
}

/// A mock metadata service client.
pub struct MockMeta {
    /// Whether register-child requests are accepted.
    accept: bool,
    /// Whether registration must first acquire a permit from `permits`.
    gated: bool,
    /// Permits for gated registration.
    permits: Semaphore,
    /// The partition count returned on success.
    new_partition_count: u32,
    /// Every received register-child request, in arrival order.
    pub requests: Mutex<Vec<RegisterChildRequest>>,
}

impl MockMeta {
    /// A metadata service which accepts registration, publishing the given count.
    pub fn accepting(new_partition_count: u32) -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            gated: false,
            permits: Semaphore::new(0),
            new_partition_count,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// A metadata service which holds every registration until a permit is released.
    pub fn accepting_gated(new_partition_count: u32) -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            gated: true,
            permits: Semaphore::new(0),
            new_partition_count,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// A metadata service which rejects every registration.
    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            accept: false,
            gated: false,
            permits: Semaphore::new(0),
            new_partition_count: 0,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Allow `n` gated registrations through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[async_trait]
impl MetaClient for MockMeta {
    async fn register_child(&self, request: RegisterChildRequest) -> Result<RegisterChildResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.accept {
            bail!("register-child rejected by metadata service");
        }
        if self.gated {
            let permit = self.permits.acquire().await.context("mock meta gate closed")?;
            permit.forget();
        }
        Ok(RegisterChildResponse {
            partition_count: self.new_partition_count,
            config: PartitionConfig {
                gpid: request.child,
                ballot: request.ballot,
                partition_count: self.new_partition_count,
            },
        })
    }
}
