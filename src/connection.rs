//! Account connection management.
//!
//! Opens the multiplexed Redis connection shared by the source and
//! destination adapters. `redis::aio::ConnectionManager` reconnects on its
//! own after the first successful connect, so retrying here only covers
//! startup.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> changefeed_migrator::Result<()> {
//! use changefeed_migrator::config::ConnectionConfig;
//! use changefeed_migrator::connection::connect;
//! use changefeed_migrator::resilience::RetryConfig;
//!
//! let account = ConnectionConfig {
//!     account_endpoint: "redis://localhost:6379".to_string(),
//!     auth_key: None,
//!     database_name: "tenants".to_string(),
//! };
//! let conn = connect(&account, &RetryConfig::startup()).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ConnectionConfig;
use crate::error::{MigrationError, Result};
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Key namespace for one container: `{database}:{container}`.
pub fn container_namespace(database: &str, container: &str) -> String {
    format!("{}:{}", database, container)
}

/// Connect to the account endpoint with retry logic.
pub async fn connect(account: &ConnectionConfig, retry_config: &RetryConfig) -> Result<ConnectionManager> {
    info!(endpoint = %account.account_endpoint, "Connecting to account");

    let mut info = account
        .account_endpoint
        .as_str()
        .into_connection_info()
        .map_err(|e| MigrationError::Config(format!("Invalid account endpoint: {}", e)))?;
    if let Some(ref key) = account.auth_key {
        info.redis.password = Some(key.clone());
    }
    let client = Client::open(info).map_err(|e| MigrationError::Config(format!("Invalid account endpoint: {}", e)))?;

    let mut attempt = 0;

    loop {
        attempt += 1;

        // Unreachable hosts can hang well past any useful deadline.
        let conn_result = timeout(retry_config.connection_timeout, client.get_connection_manager()).await;

        let failure = match conn_result {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(attempt, "Connected to account after retry");
                } else {
                    info!("Connected to account");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", retry_config.connection_timeout.as_millis()),
        };

        if attempt >= retry_config.max_attempts {
            error!(attempt, error = %failure, "Failed to connect after max retries");
            return Err(MigrationError::redis_msg(
                "CONNECT",
                format!("Connection failed after {} attempts: {}", attempt, failure),
            ));
        }

        let delay = retry_config.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Ping the account to check connection health. Returns the round-trip latency.
pub async fn ping(conn: &mut ConnectionManager) -> Result<Duration> {
    let start = Instant::now();
    let result: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| MigrationError::redis("PING", e))?;

    if result == "PONG" {
        Ok(start.elapsed())
    } else {
        Err(MigrationError::redis_msg("PING", format!("Unexpected PING response: {}", result)))
    }
}
