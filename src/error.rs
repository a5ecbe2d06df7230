//! Helix error abstractions.

use crate::primitives::{Ballot, Decree};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// The error type used to indicate that a system shutdown is required.
///
/// Consistency-affecting invariant violations (a regressing confirmed decree, a malformed
/// duplication descriptor) indicate a logic error elsewhere in the system; continuing
/// risks silent data loss, so the owning controller turns this error into a shutdown
/// broadcast rather than attempting recovery.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A log range required for duplication was already garbage collected.
///
/// This is a corruption-class failure: the duplication task cannot make progress and must
/// be surfaced to the operator/metadata service, not retried or silently skipped.
#[derive(Debug, thiserror::Error)]
#[error(
    "logs not yet duplicated were truncated [max_gced_decree: {max_gced_decree}, start_decree: {start_decree}, confirmed_decree: {confirmed_decree}, last_decree: {last_decree}]"
)]
pub struct LogTruncatedError {
    pub max_gced_decree: Decree,
    pub start_decree: Decree,
    pub confirmed_decree: Decree,
    pub last_decree: Decree,
}

/// Errors returned to a split child when its catch-up notification is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// The parent has no split in progress for the requesting child.
    #[error("no partition split in progress")]
    NoActiveSplit,
    /// The ballot moved since the split started; the attempt is invalid.
    #[error("ballot changed since split start [recorded: {recorded}, current: {current}]")]
    BallotChanged { recorded: Ballot, current: Ballot },
}
