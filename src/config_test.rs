use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let mut config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "helix-east".into()),
        ("APP_NAME".into(), "events".into()),
        ("REPLICA_NAME".into(), "events-3".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/helix/data".into()),
        ("DUPLICATION_BATCH_SIZE".into(), "500".into()),
        ("CATCH_UP_NOTIFY_ATTEMPTS".into(), "5".into()),
    ])?;
    config.partition = 3;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(
        config.cluster_name == "helix-east",
        "unexpected value parsed for CLUSTER_NAME, got {}, expected {}",
        config.cluster_name,
        "helix-east"
    );
    assert!(config.app_name == "events", "unexpected value parsed for APP_NAME, got {}, expected {}", config.app_name, "events");
    assert!(
        config.replica_name == "events-3",
        "unexpected value parsed for REPLICA_NAME, got {}, expected {}",
        config.replica_name,
        "events-3"
    );
    assert!(config.partition == 3, "unexpected value derived for partition, got {}, expected {}", config.partition, 3);
    assert!(
        config.storage_data_path == "/usr/local/helix/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/helix/data"
    );
    assert!(
        config.duplication_batch_size == 500,
        "unexpected value parsed for DUPLICATION_BATCH_SIZE, got {}, expected {}",
        config.duplication_batch_size,
        500
    );
    assert!(
        config.catch_up_notify_attempts == 5,
        "unexpected value parsed for CATCH_UP_NOTIFY_ATTEMPTS, got {}, expected {}",
        config.catch_up_notify_attempts,
        5
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "helix-east".into()),
        ("APP_NAME".into(), "events".into()),
        ("REPLICA_NAME".into(), "events-0".into()),
    ])?;

    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert!(
        config.duplication_batch_size == 100,
        "unexpected default for DUPLICATION_BATCH_SIZE, got {}, expected {}",
        config.duplication_batch_size,
        100
    );
    assert!(
        config.catch_up_notify_attempts == 10,
        "unexpected default for CATCH_UP_NOTIFY_ATTEMPTS, got {}, expected {}",
        config.catch_up_notify_attempts,
        10
    );

    Ok(())
}
