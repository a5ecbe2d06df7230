use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::database::Database;
use crate::duplication::{DuplicationCtl, DuplicationCtlMsg, DuplicationHandle};
use crate::fixtures::{self, MockRemote};
use crate::primitives::{DuplicationStatus, Gpid};
use crate::replica::Replica;

struct PipelineHarness {
    handle: DuplicationHandle,
    ctl_handle: tokio::task::JoinHandle<Result<()>>,
    shutdown_tx: broadcast::Sender<()>,
    replica: Replica,
    _tx: mpsc::Sender<DuplicationCtlMsg>,
    _tmpdir: tempfile::TempDir,
}

/// Spawn a running duplication controller over a replica with `precommit` mutations,
/// optionally garbage collecting the log through `gc_through` first.
async fn spawn_running(remote: Arc<MockRemote>, confirmed_decree: u64, precommit: usize, gc_through: u64) -> Result<PipelineHarness> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let replica = fixtures::setup_primary_replica(&config, &db, Gpid::new(1, 0), 4, 7).await?;
    fixtures::commit_mutations(&replica, precommit).await?;
    if gc_through > 0 {
        replica.log().gc_through(gc_through).await?;
    }
    let (shutdown_tx, _) = broadcast::channel(10);
    let (events_tx, events_rx) = mpsc::channel(100);
    let descriptor = fixtures::descriptor(1, 0, DuplicationStatus::Running, confirmed_decree);
    let ctl = DuplicationCtl::new(
        config,
        replica.clone(),
        remote,
        descriptor,
        shutdown_tx.clone(),
        events_tx.clone(),
        events_rx,
    )?;
    let handle = ctl.handle();
    let ctl_handle = ctl.spawn();
    Ok(PipelineHarness {
        handle,
        ctl_handle,
        shutdown_tx,
        replica,
        _tx: events_tx,
        _tmpdir: tmpdir,
    })
}

#[tokio::test]
async fn fresh_mutations_are_loaded_from_the_window() -> Result<()> {
    let remote = MockRemote::new();
    let harness = spawn_running(remote.clone(), 0, 10, 0).await?;

    fixtures::wait_for(|| harness.handle.progress().confirmed_decree == 10, "backlog to be confirmed").await;
    let shipped = remote.shipped_decrees();
    assert_eq!(shipped, (1..=10).collect::<Vec<_>>(), "expected decrees 1..=10 shipped in order, got {:?}", shipped);

    let _ = harness.shutdown_tx.send(());
    harness.ctl_handle.await??;
    Ok(())
}

#[tokio::test]
async fn historical_mutations_are_loaded_from_the_private_log() -> Result<()> {
    // 150 commits push the oldest decrees out of the in-memory window, forcing the
    // pipeline through the private log for the backfill, then back to the window.
    let remote = MockRemote::new();
    let harness = spawn_running(remote.clone(), 10, 150, 0).await?;

    fixtures::wait_for(|| harness.handle.progress().confirmed_decree == 150, "backfill and fresh data to be confirmed").await;
    let mut shipped = remote.shipped_decrees();
    shipped.sort_unstable();
    assert_eq!(shipped, (11..=150).collect::<Vec<_>>(), "expected decrees 11..=150 shipped, got {:?}", shipped);
    {
        let batches = remote.shipped.lock().unwrap();
        let first = batches.first().expect("expected at least one shipped batch");
        assert_eq!(first.first().copied(), Some(11), "expected the first batch to begin the backfill at decree 11");
        assert_eq!(first.len(), 100, "expected the first batch to carry a full log read, got {}", first.len());
    }

    let _ = harness.shutdown_tx.send(());
    harness.ctl_handle.await??;
    Ok(())
}

#[tokio::test]
async fn truncated_log_surfaces_corruption_and_pauses_the_task() -> Result<()> {
    // The task still needs decree 11 onward, but the log was garbage collected through
    // decree 50 and the window no longer reaches back that far.
    let remote = MockRemote::new();
    let harness = spawn_running(remote.clone(), 10, 150, 50).await?;

    fixtures::wait_for(|| harness.handle.status() == DuplicationStatus::Paused, "task to pause on corruption").await;
    assert!(remote.shipped_decrees().is_empty(), "expected nothing shipped after corruption, got {:?}", remote.shipped_decrees());
    assert_eq!(
        harness.handle.progress().confirmed_decree,
        10,
        "expected confirmed decree untouched by the failed pipeline"
    );

    let _ = harness.shutdown_tx.send(());
    harness.ctl_handle.await??;
    Ok(())
}

#[tokio::test]
async fn transient_ship_failures_are_retried() -> Result<()> {
    let remote = MockRemote::new();
    remote.fail_next(2);
    let harness = spawn_running(remote.clone(), 0, 5, 0).await?;

    fixtures::wait_for(|| harness.handle.progress().confirmed_decree == 5, "batch to be confirmed after retries").await;
    let shipped = remote.shipped_decrees();
    assert_eq!(shipped, (1..=5).collect::<Vec<_>>(), "expected a single successful batch, got {:?}", shipped);

    let _ = harness.shutdown_tx.send(());
    harness.ctl_handle.await??;
    Ok(())
}

#[tokio::test]
async fn partial_acknowledgment_re_ships_the_remainder() -> Result<()> {
    let remote = MockRemote::new();
    remote.cap_next_ack(6);
    let harness = spawn_running(remote.clone(), 0, 10, 0).await?;

    fixtures::wait_for(|| harness.handle.progress().confirmed_decree == 10, "full batch to be confirmed").await;
    {
        let batches = remote.shipped.lock().unwrap();
        assert_eq!(batches.len(), 2, "expected a re-ship after the partial ack, got {:?}", *batches);
        assert_eq!(batches[0], (1..=10).collect::<Vec<_>>(), "unexpected first batch {:?}", batches[0]);
        assert_eq!(batches[1], (7..=10).collect::<Vec<_>>(), "expected the unconfirmed remainder re-shipped, got {:?}", batches[1]);
    }

    let _ = harness.shutdown_tx.send(());
    harness.ctl_handle.await??;
    Ok(())
}
