//! Layered configuration.
//!
//! Embedded defaults are the base layer so the binary works with nothing but
//! a cluster URL; a `migrator.toml` in the working directory, an explicit
//! `--config` path and `MIGRATOR__`-prefixed environment variables override
//! in that order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for the search cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base URL of the cluster REST API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Hidden index holding the migration status document.
    #[serde(default = "default_status_index")]
    pub status_index: String,

    /// Document id of the singleton status record.
    #[serde(default = "default_status_document_id")]
    pub status_document_id: String,
}

fn default_base_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_status_index() -> String {
    ".migrator_status".to_string()
}

fn default_status_document_id() -> String {
    "tenant_migration".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            status_index: default_status_index(),
            status_document_id: default_status_document_id(),
        }
    }
}

/// What to migrate and how aggressively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// External tenant names whose indices are consolidated.
    #[serde(default)]
    pub tenants: Vec<String>,

    /// Alias of the mandatory global tenant index.
    #[serde(default = "default_global_tenant_alias")]
    pub global_tenant_alias: String,

    /// Name prefix of the consolidated destination index.
    #[serde(default = "default_destination_prefix")]
    pub destination_prefix: String,

    /// Layout version baked into the destination index name.
    #[serde(default = "default_destination_version")]
    pub destination_version: u32,

    /// Parallel slices for the bulk copy. 0 = derive from core count.
    #[serde(default)]
    pub slice_count: usize,

    /// Documents per bulk request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retry attempts per slice for transient store failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,

    /// Delay ceiling in milliseconds for exponential backoff.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_global_tenant_alias() -> String {
    "global_tenant".to_string()
}

fn default_destination_prefix() -> String {
    "tenant_data".to_string()
}

fn default_destination_version() -> u32 {
    2
}

fn default_batch_size() -> usize {
    500
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_min_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            global_tenant_alias: default_global_tenant_alias(),
            destination_prefix: default_destination_prefix(),
            destination_version: default_destination_version(),
            slice_count: 0,
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl MigrationConfig {
    /// Effective slice count: the configured value, or one slice per core
    /// (minimum 2) when left at 0.
    pub fn effective_slice_count(&self) -> usize {
        if self.slice_count > 0 {
            return self.slice_count;
        }
        let cores = System::new_all().cpus().len();
        cores.max(2)
    }

    /// Name of the consolidated destination index.
    pub fn destination_index(&self) -> String {
        format!("{}_v{}", self.destination_prefix, self.destination_version)
    }
}

/// Distributed run lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Seconds after which a Running status document with no updates is
    /// considered abandoned and may be taken over.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    1800
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional directory for file logging; stderr only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so the binary works without files.
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let local_config = PathBuf::from("migrator.toml");
        if local_config.exists() {
            builder = builder.add_source(config::File::from(local_config));
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with MIGRATOR_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("MIGRATOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster.base_url, "http://localhost:9200");
        assert_eq!(config.lock.stale_after_secs, 1800);
        assert_eq!(config.migration.destination_index(), "tenant_data_v2");
        assert!(config.migration.effective_slice_count() >= 2);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[migration]\ntenants = [\"alpha\", \"beta\"]\nslice_count = 4\n\
             [lock]\nstale_after_secs = 60"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.migration.tenants, vec!["alpha", "beta"]);
        assert_eq!(config.migration.effective_slice_count(), 4);
        assert_eq!(config.lock.stale_after_secs, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.cluster.request_timeout_secs, 30);
    }
}
