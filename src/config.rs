//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The name of this cluster, used as the origin tag of duplicated mutations.
    pub cluster_name: String,
    /// The name of the application to which this replica belongs.
    pub app_name: String,
    /// The name of this replica, formatted as `{app_name}-{partition}`.
    pub replica_name: String,
    /// The partition of this replica.
    ///
    /// This value is derived from the `replica_name` value.
    #[serde(skip, default)]
    pub partition: u32,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The maximum number of mutations shipped to the remote cluster per batch.
    #[serde(default = "Config::default_duplication_batch_size")]
    pub duplication_batch_size: u32,
    /// The number of times a split child re-sends its catch-up notification on a
    /// transient failure before terminating itself.
    #[serde(default = "Config::default_catch_up_notify_attempts")]
    pub catch_up_notify_attempts: u32,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the
    /// application config from that. In the future, this may take into account an
    /// optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.partition = config
            .replica_name
            .split('-')
            .last()
            .and_then(|partition_str| partition_str.parse().ok())
            .context("invalid replica name, expected partition suffix at the end of the name")?;
        Ok(config)
    }

    fn default_duplication_batch_size() -> u32 {
        100
    }

    fn default_catch_up_notify_attempts() -> u32 {
        10
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for testing, backed by a temp data dir.
    pub fn new_test() -> Result<(std::sync::Arc<Config>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating temp dir for test config")?;
        let config = Config {
            rust_log: "".into(),
            cluster_name: "helix-test".into(),
            app_name: "events".into(),
            replica_name: "events-0".into(),
            partition: 0,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            duplication_batch_size: Self::default_duplication_batch_size(),
            catch_up_notify_attempts: 3,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
