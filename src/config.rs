//! Configuration for the migrator.
//!
//! Configuration is loaded once at startup (YAML or JSON) and is immutable for
//! the lifetime of the process. It can also be constructed programmatically.
//!
//! # Configuration Structure
//!
//! ```text
//! MigrationConfig
//! ├── instance_name: String          # Lease owner id for this process
//! ├── processor_name: String         # Namespace for lease records
//! ├── connection: ConnectionConfig   # Account endpoint, key, database
//! ├── target: MigrationTarget        # Source/destination containers
//! ├── lease: LeaseConfig             # Lease store + timing
//! ├── replay: ReplayConfig           # Batch size, polling, retries
//! ├── source: SourceConfig           # Change stream read behaviour
//! └── destination: DestinationConfig # Destination write limits
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! instance_name: "migrator-1"
//!
//! connection:
//!   account_endpoint: "redis://cache.internal:6379"
//!   auth_key: "${MIGRATOR_AUTH_KEY}"
//!   database_name: "tenants"
//!
//! target:
//!   source_container: "Tenant1"
//!   destination_container: "Tenant1-Premium"
//!   destination_throughput: 400
//!
//! lease:
//!   sqlite_path: "/var/lib/migrator/leases.db"
//!   container_name: "leases"
//!   lease_duration: "60s"
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references are expanded from the environment
//! before parsing, so credentials never need to live in the file.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MigrationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Lease owner identity for this process.
    ///
    /// Keep it stable across restarts: a restarted instance with the same name
    /// reclaims its own leases without waiting for them to expire.
    pub instance_name: String,

    /// Namespace for lease records, so several migrations can share one lease store.
    #[serde(default = "default_processor_name")]
    pub processor_name: String,

    /// Account endpoint and credentials.
    pub connection: ConnectionConfig,

    /// What is migrated where.
    pub target: MigrationTarget,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub destination: DestinationConfig,
}

fn default_processor_name() -> String {
    "MigrationChangeFeedProcessor".to_string()
}

impl MigrationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            processor_name: default_processor_name(),
            connection: ConnectionConfig {
                account_endpoint: "redis://127.0.0.1:6379".to_string(),
                auth_key: None,
                database_name: "test".to_string(),
            },
            target: MigrationTarget::for_testing("source", "destination"),
            lease: LeaseConfig::for_testing(),
            replay: ReplayConfig::for_testing(),
            source: SourceConfig::default(),
            destination: DestinationConfig::default(),
        }
    }

    /// Parse a YAML (or JSON) document, expanding `${VAR}` references first.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| MigrationError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Validate the configuration.
    ///
    /// Everything that would otherwise fail late (bad durations, unusable
    /// table names, impossible renew timing) is rejected here, before any
    /// connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(MigrationError::Config("instance_name must not be empty".into()));
        }
        if self.processor_name.trim().is_empty() {
            return Err(MigrationError::Config("processor_name must not be empty".into()));
        }
        if self.connection.account_endpoint.trim().is_empty() {
            return Err(MigrationError::Config("connection.account_endpoint must not be empty".into()));
        }
        if self.connection.auth_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(MigrationError::Config(
                "connection.auth_key is empty (unset environment variable?); omit it to connect without auth".into(),
            ));
        }
        if self.connection.database_name.trim().is_empty() {
            return Err(MigrationError::Config("connection.database_name must not be empty".into()));
        }
        self.target.validate()?;
        self.lease.validate()?;
        self.replay.validate()?;
        if self.source.read_attempts == 0 {
            return Err(MigrationError::Config("source.read_attempts must be at least 1".into()));
        }
        if self.destination.max_item_bytes == 0 {
            return Err(MigrationError::Config("destination.max_item_bytes must be positive".into()));
        }
        Ok(())
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            match (std::env::var(var_name), default) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => {
                    warn!(variable = %var_name, "Config references unset environment variable, expanding to empty");
                    String::new()
                }
            }
        })
        .to_string()
}

/// Parse a humantime duration string, naming the field on failure.
fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| MigrationError::Config(format!("{} '{}' is not a duration: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Account endpoint, credential and database.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoint URL, e.g. `"redis://cache.internal:6379"`.
    pub account_endpoint: String,

    /// Credential for the endpoint. Prefer `${ENV_VAR}` in config files.
    #[serde(default)]
    pub auth_key: Option<String>,

    /// Database name. Containers are addressed inside this namespace.
    pub database_name: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("account_endpoint", &self.account_endpoint)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("database_name", &self.database_name)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MigrationTarget: the migration target descriptor
// ═══════════════════════════════════════════════════════════════════════════════

/// Static description of what is migrated where. Read-only after start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationTarget {
    /// Source container whose change stream is replayed.
    pub source_container: String,

    /// Destination container (created if missing).
    pub destination_container: String,

    /// Partition key path of the source container (JSON pointer, e.g. `/tenantId`).
    #[serde(default = "default_partition_key_path")]
    pub source_partition_key_path: String,

    /// Partition key path for the destination. Defaults to the source's path.
    ///
    /// The destination may re-partition by a different path, but every record
    /// keeps its partition key *value* so later updates route consistently.
    #[serde(default)]
    pub destination_partition_key_path: Option<String>,

    /// Desired destination throughput, in writes per second.
    #[serde(default)]
    pub destination_throughput: Option<u32>,
}

fn default_partition_key_path() -> String {
    "/id".to_string()
}

impl MigrationTarget {
    /// Create a target for testing.
    pub fn for_testing(source: &str, destination: &str) -> Self {
        Self {
            source_container: source.to_string(),
            destination_container: destination.to_string(),
            source_partition_key_path: default_partition_key_path(),
            destination_partition_key_path: None,
            destination_throughput: None,
        }
    }

    /// The effective destination partition key path.
    pub fn destination_key_path(&self) -> &str {
        self.destination_partition_key_path
            .as_deref()
            .unwrap_or(&self.source_partition_key_path)
    }

    fn validate(&self) -> Result<()> {
        if self.source_container.trim().is_empty() {
            return Err(MigrationError::Config("target.source_container must not be empty".into()));
        }
        if self.destination_container.trim().is_empty() {
            return Err(MigrationError::Config(
                "target.destination_container must not be empty".into(),
            ));
        }
        if self.source_container == self.destination_container {
            return Err(MigrationError::Config(format!(
                "source and destination container are both '{}'",
                self.source_container
            )));
        }
        for path in [self.source_partition_key_path.as_str(), self.destination_key_path()] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(MigrationError::Config(format!(
                    "partition key path '{}' must look like '/field'",
                    path
                )));
            }
        }
        if self.destination_throughput == Some(0) {
            return Err(MigrationError::Config(
                "target.destination_throughput must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaseConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease store location and lease timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Path to the SQLite database holding lease records.
    #[serde(default = "default_lease_sqlite_path")]
    pub sqlite_path: String,

    /// Lease container (table) name. Letters, digits and `_` only.
    #[serde(default = "default_lease_container")]
    pub container_name: String,

    /// Provisioned throughput hint for the lease container.
    /// Stores without provisioned throughput log and ignore it.
    #[serde(default)]
    pub throughput: Option<u32>,

    /// How long an unrenewed lease stays live.
    #[serde(default = "default_lease_duration")]
    pub lease_duration: String,

    /// How often owned leases are renewed. Defaults to half the lease duration.
    #[serde(default)]
    pub renew_interval: Option<String>,

    /// How often partitions and leases are re-listed.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: String,

    /// Upper bound on partitions this instance owns at once.
    #[serde(default)]
    pub max_partitions: Option<usize>,
}

fn default_lease_sqlite_path() -> String {
    "migration_leases.db".to_string()
}

fn default_lease_container() -> String {
    "leases".to_string()
}

fn default_lease_duration() -> String {
    "60s".to_string()
}

fn default_discovery_interval() -> String {
    "13s".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_lease_sqlite_path(),
            container_name: default_lease_container(),
            throughput: None,
            lease_duration: default_lease_duration(),
            renew_interval: None,
            discovery_interval: default_discovery_interval(),
            max_partitions: None,
        }
    }
}

impl LeaseConfig {
    /// Short timings and an in-memory database for tests.
    pub fn for_testing() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            container_name: default_lease_container(),
            throughput: None,
            lease_duration: "2s".to_string(),
            renew_interval: Some("200ms".to_string()),
            discovery_interval: "50ms".to_string(),
            max_partitions: None,
        }
    }

    /// Lease duration as a Duration (falls back to 60s).
    pub fn lease_duration(&self) -> Duration {
        humantime::parse_duration(&self.lease_duration).unwrap_or(Duration::from_secs(60))
    }

    /// Renew interval as a Duration (falls back to half the lease duration).
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or_else(|| self.lease_duration() / 2)
    }

    /// Discovery interval as a Duration (falls back to 13s).
    pub fn discovery_interval(&self) -> Duration {
        humantime::parse_duration(&self.discovery_interval).unwrap_or(Duration::from_secs(13))
    }

    fn validate(&self) -> Result<()> {
        if self.sqlite_path.trim().is_empty() {
            return Err(MigrationError::Config("lease.sqlite_path must not be empty".into()));
        }
        if !is_valid_identifier(&self.container_name) {
            return Err(MigrationError::Config(format!(
                "lease.container_name '{}' may only contain letters, digits and '_'",
                self.container_name
            )));
        }
        let lease = parse_duration("lease.lease_duration", &self.lease_duration)?;
        parse_duration("lease.discovery_interval", &self.discovery_interval)?;
        if let Some(ref renew) = self.renew_interval {
            let renew = parse_duration("lease.renew_interval", renew)?;
            if renew >= lease {
                return Err(MigrationError::Config(format!(
                    "lease.renew_interval ({:?}) must be shorter than lease.lease_duration ({:?})",
                    renew, lease
                )));
            }
        }
        if lease.is_zero() {
            return Err(MigrationError::Config("lease.lease_duration must be positive".into()));
        }
        if self.max_partitions == Some(0) {
            return Err(MigrationError::Config("lease.max_partitions must be positive when set".into()));
        }
        Ok(())
    }
}

/// Table names are spliced into SQL, so keep them to `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Maximum records per change stream read.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Sleep between reads when a partition has no new changes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Attempts per record before a transient destination failure fails the partition.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: usize,

    /// Initial backoff between write attempts.
    #[serde(default = "default_write_backoff")]
    pub write_backoff: String,

    /// Attempts to persist a checkpoint before the partition is failed.
    #[serde(default = "default_checkpoint_attempts")]
    pub checkpoint_attempts: usize,

    /// Concurrent upserts per batch. 1 applies strictly in order.
    #[serde(default = "default_apply_concurrency")]
    pub apply_concurrency: usize,

    /// Keep only the latest snapshot per record within a batch.
    #[serde(default = "default_true")]
    pub coalesce_by_id: bool,

    /// How long shutdown waits for workers to drain before abandoning their leases.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    /// Base backoff before this instance retries a failed partition.
    /// Actual backoff = min(base * 2^consecutive_failures, max).
    #[serde(default = "default_failure_backoff_base_sec")]
    pub failure_backoff_base_sec: u64,

    /// Ceiling for the failed-partition backoff.
    #[serde(default = "default_failure_backoff_max_sec")]
    pub failure_backoff_max_sec: u64,

    /// Minimum time between lag estimates per partition. Each estimate costs
    /// extra reads against the source.
    #[serde(default = "default_lag_sample_interval")]
    pub lag_sample_interval: String,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_max_write_attempts() -> usize {
    5
}

fn default_write_backoff() -> String {
    "100ms".to_string()
}

fn default_checkpoint_attempts() -> usize {
    5
}

fn default_apply_concurrency() -> usize {
    1
}

fn default_shutdown_grace() -> String {
    "10s".to_string()
}

fn default_failure_backoff_base_sec() -> u64 {
    5
}

fn default_failure_backoff_max_sec() -> u64 {
    300
}

fn default_lag_sample_interval() -> String {
    "30s".to_string()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            poll_interval: default_poll_interval(),
            max_write_attempts: default_max_write_attempts(),
            write_backoff: default_write_backoff(),
            checkpoint_attempts: default_checkpoint_attempts(),
            apply_concurrency: default_apply_concurrency(),
            coalesce_by_id: true,
            shutdown_grace: default_shutdown_grace(),
            failure_backoff_base_sec: default_failure_backoff_base_sec(),
            failure_backoff_max_sec: default_failure_backoff_max_sec(),
            lag_sample_interval: default_lag_sample_interval(),
        }
    }
}

impl ReplayConfig {
    /// Fast polling and short backoffs for tests.
    pub fn for_testing() -> Self {
        Self {
            max_batch_size: 10,
            poll_interval: "10ms".to_string(),
            max_write_attempts: 3,
            write_backoff: "1ms".to_string(),
            checkpoint_attempts: 3,
            apply_concurrency: 1,
            coalesce_by_id: true,
            shutdown_grace: "2s".to_string(),
            failure_backoff_base_sec: 0,
            failure_backoff_max_sec: 0,
            lag_sample_interval: "1s".to_string(),
        }
    }

    /// Poll interval as a Duration (falls back to 5s).
    pub fn poll_interval(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(5))
    }

    /// Write backoff as a Duration (falls back to 100ms).
    pub fn write_backoff(&self) -> Duration {
        humantime::parse_duration(&self.write_backoff).unwrap_or(Duration::from_millis(100))
    }

    /// Shutdown grace as a Duration (falls back to 10s).
    pub fn shutdown_grace(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(10))
    }

    /// Lag sample interval as a Duration (falls back to 30s).
    pub fn lag_sample_interval(&self) -> Duration {
        humantime::parse_duration(&self.lag_sample_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Backoff before retrying a partition after `consecutive_failures` failures.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        let backoff_secs = self
            .failure_backoff_base_sec
            .saturating_mul(2u64.saturating_pow(consecutive_failures));
        Duration::from_secs(backoff_secs.min(self.failure_backoff_max_sec))
    }

    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(MigrationError::Config("replay.max_batch_size must be at least 1".into()));
        }
        if self.max_write_attempts == 0 {
            return Err(MigrationError::Config("replay.max_write_attempts must be at least 1".into()));
        }
        if self.checkpoint_attempts == 0 {
            return Err(MigrationError::Config("replay.checkpoint_attempts must be at least 1".into()));
        }
        if self.apply_concurrency == 0 {
            return Err(MigrationError::Config("replay.apply_concurrency must be at least 1".into()));
        }
        if self.apply_concurrency > 1 && !self.coalesce_by_id {
            // Without coalescing two writes for one record could race.
            return Err(MigrationError::Config(
                "replay.apply_concurrency > 1 requires replay.coalesce_by_id".into(),
            ));
        }
        parse_duration("replay.poll_interval", &self.poll_interval)?;
        parse_duration("replay.write_backoff", &self.write_backoff)?;
        parse_duration("replay.shutdown_grace", &self.shutdown_grace)?;
        parse_duration("replay.lag_sample_interval", &self.lag_sample_interval)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig / DestinationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Change stream read behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Attempts per read before the error surfaces to the worker.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: usize,
}

fn default_read_attempts() -> usize {
    5
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            read_attempts: default_read_attempts(),
        }
    }
}

/// Destination write limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Payloads larger than this are rejected permanently.
    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: usize,
}

fn default_max_item_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            max_item_bytes: default_max_item_bytes(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
