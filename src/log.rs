//! Private log management.
//!
//! Each partition owns a durable log of its committed mutations. The log is read-shared
//! by normal replication, the split coordinator's state transfer and the duplication
//! pipeline's historical loading; none of those callers truncate it directly. Retention
//! is governed solely by the max garbage-collected decree watermark advanced through
//! [`MutationLog::gc_through`], which duplication must check before trusting any read.

use anyhow::{bail, Context, Result};

use crate::database::{Database, Tree};
use crate::error::{ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::primitives::{Decree, Gpid, Mutation};
use crate::utils;

/// The key prefix used for storing mutation records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always
/// use the `utils::encode_byte_prefix` method.
pub const PREFIX_LOG_MUTATION: &[u8; 1] = b"m";
/// The key used to store the max garbage-collected decree watermark.
pub const KEY_MAX_GCED_DECREE: &[u8; 1] = b"g";

/// A handle to one partition's private log of committed mutations.
#[derive(Clone)]
pub struct MutationLog {
    /// The partition which owns this log.
    gpid: Gpid,
    /// The log's database tree.
    tree: Tree,
}

impl MutationLog {
    /// Open the private log of the given partition.
    pub async fn open(db: &Database, gpid: Gpid) -> Result<Self> {
        let tree = db.get_log_tree(gpid).await?;
        Ok(Self { gpid, tree })
    }

    /// Append a batch of committed mutations to the log.
    pub async fn append(&self, mutations: &[Mutation]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for mutation in mutations {
            let record = utils::encode_model(mutation)?;
            batch.insert(&utils::encode_byte_prefix(PREFIX_LOG_MUTATION, mutation.decree), record.as_slice());
        }
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            tree.apply_batch(batch).context("error appending mutations to private log")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)
    }

    /// Read committed mutations in the decree range `[from, through]`, up to `max` records.
    ///
    /// Runs on the blocking lane so large historical scans do not stall the async workers.
    pub async fn read_range(&self, from: Decree, through: Decree, max: usize) -> Result<Vec<Mutation>> {
        if from > through || max == 0 {
            return Ok(Vec::new());
        }
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<Vec<Mutation>> {
            let start = utils::encode_byte_prefix(PREFIX_LOG_MUTATION, from);
            let stop = utils::encode_byte_prefix(PREFIX_LOG_MUTATION, through);
            let mut mutations = Vec::with_capacity(max.min(1024));
            for kv_res in tree.range::<_, std::ops::RangeInclusive<&[u8]>>(&start[..]..=&stop[..]) {
                let (_key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                let mutation: Mutation = utils::decode_model(val.as_ref())?;
                mutations.push(mutation);
                if mutations.len() >= max {
                    break;
                }
            }
            Ok(mutations)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)
    }

    /// The highest decree already garbage collected from this log, `0` if none.
    pub fn max_gced_decree(&self) -> Result<Decree> {
        let watermark = self
            .tree
            .get(KEY_MAX_GCED_DECREE)
            .context("error fetching max gced decree watermark")?
            .map(|val| utils::decode_u64(&val))
            .transpose()?
            .unwrap_or(0);
        Ok(watermark)
    }

    /// Garbage collect all log records with decree `<= through`, advancing the watermark.
    ///
    /// The watermark never regresses.
    pub async fn gc_through(&self, through: Decree) -> Result<()> {
        let current = self.max_gced_decree()?;
        if through <= current {
            bail!("gc watermark for log {} may not regress [current: {}, requested: {}]", self.gpid, current, through);
        }
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            let start = utils::encode_byte_prefix(PREFIX_LOG_MUTATION, 0);
            let stop = utils::encode_byte_prefix(PREFIX_LOG_MUTATION, through);
            for key_res in tree.range::<_, std::ops::RangeInclusive<&[u8]>>(&start[..]..=&stop[..]).keys() {
                let key = key_res.context(ERR_ITER_FAILURE)?;
                batch.remove(key);
            }
            batch.insert(KEY_MAX_GCED_DECREE, &utils::encode_u64(through));
            tree.apply_batch(batch).context("error applying gc batch to private log")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res)
    }
}
