//! The Helix replica evolution controller.
//!
//! Helix replicas normally live a quiet life inside a primary/secondary replication
//! group; this crate covers the two protocols which evolve a running group without
//! stopping traffic:
//!
//! - **Partition split** ([`split`]): a parent partition spawns a child, transfers its
//!   checkpoint & log, keeps serving while the child catches up, and registers the child
//!   with the cluster metadata service once catch-up is confirmed.
//! - **Duplication** ([`duplication`]): a persistent pipeline tails a partition's private
//!   log and ships committed mutations to a remote cluster, tracking a durable, monotonic
//!   confirmation watermark.
//!
//! Consensus, request serving, transport and process bootstrap are external
//! collaborators, reached only through the narrow surfaces in [`replica`] and [`meta`].

pub mod config;
#[cfg(test)]
mod config_test;
pub mod database;
pub mod duplication;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod log;
#[cfg(test)]
mod log_test;
pub mod meta;
pub mod primitives;
pub mod replica;
pub mod split;
pub mod utils;
#[cfg(test)]
mod utils_test;
