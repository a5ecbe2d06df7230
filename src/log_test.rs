use anyhow::Result;

use crate::config::Config;
use crate::database::Database;
use crate::log::MutationLog;
use crate::primitives::{Gpid, Mutation};

async fn setup_log_with_mutations(count: u64) -> Result<(MutationLog, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let log = MutationLog::open(&db, Gpid::new(1, 0)).await?;
    let mutations: Vec<_> = (1..=count)
        .map(|decree| Mutation {
            decree,
            ballot: 1,
            payload: decree.to_be_bytes().to_vec(),
        })
        .collect();
    log.append(&mutations).await?;
    Ok((log, tmpdir))
}

#[tokio::test]
async fn read_range_returns_requested_decrees_in_order() -> Result<()> {
    let (log, _tmpdir) = setup_log_with_mutations(50).await?;

    let mutations = log.read_range(10, 20, usize::MAX).await?;

    let decrees: Vec<_> = mutations.iter().map(|m| m.decree).collect();
    let expected: Vec<_> = (10..=20).collect();
    assert_eq!(decrees, expected, "expected decrees {:?} got {:?}", expected, decrees);
    Ok(())
}

#[tokio::test]
async fn read_range_honors_max_batch_size() -> Result<()> {
    let (log, _tmpdir) = setup_log_with_mutations(50).await?;

    let mutations = log.read_range(1, 50, 7).await?;

    assert_eq!(mutations.len(), 7, "expected 7 mutations got {}", mutations.len());
    assert_eq!(mutations[0].decree, 1, "expected batch to start at decree 1 got {}", mutations[0].decree);
    Ok(())
}

#[tokio::test]
async fn read_range_empty_for_inverted_range() -> Result<()> {
    let (log, _tmpdir) = setup_log_with_mutations(10).await?;

    let mutations = log.read_range(20, 10, usize::MAX).await?;

    assert!(mutations.is_empty(), "expected empty read got {} mutations", mutations.len());
    Ok(())
}

#[tokio::test]
async fn gc_through_advances_watermark_and_deletes_records() -> Result<()> {
    let (log, _tmpdir) = setup_log_with_mutations(50).await?;
    assert_eq!(log.max_gced_decree()?, 0, "expected pristine gc watermark to be 0");

    log.gc_through(20).await?;

    assert_eq!(log.max_gced_decree()?, 20, "expected gc watermark to be 20 got {}", log.max_gced_decree()?);
    let mutations = log.read_range(1, 50, usize::MAX).await?;
    assert_eq!(mutations.len(), 30, "expected 30 surviving mutations got {}", mutations.len());
    assert_eq!(mutations[0].decree, 21, "expected first surviving decree to be 21 got {}", mutations[0].decree);
    Ok(())
}

#[tokio::test]
async fn gc_watermark_may_not_regress() -> Result<()> {
    let (log, _tmpdir) = setup_log_with_mutations(50).await?;
    log.gc_through(20).await?;

    let res = log.gc_through(10).await;

    assert!(res.is_err(), "expected gc watermark regression to be rejected");
    assert_eq!(log.max_gced_decree()?, 20, "expected gc watermark to remain 20 got {}", log.max_gced_decree()?);
    Ok(())
}
