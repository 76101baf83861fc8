// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! The source change stream and the destination container both live in one
//! Redis, under different key namespaces.

use changefeed_migrator::config::ConnectionConfig;
use changefeed_migrator::connection::{connect, container_namespace};
use changefeed_migrator::resilience::RetryConfig;
use changefeed_migrator::{RedisChangeFeed, RedisDestination};
use redis::aio::ConnectionManager;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const DATABASE: &str = "testdb";

/// Create a vanilla Redis container.
///
/// Uses the official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// One Redis account holding a source and a destination container.
pub struct TestAccount<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
    pub conn: ConnectionManager,
}

impl<'a> TestAccount<'a> {
    pub async fn start(docker: &'a Cli) -> TestAccount<'a> {
        let container = redis_container(docker);
        let url = redis_url(&container);
        let conn = connect(&Self::connection_config_for(&url), &RetryConfig::testing())
            .await
            .expect("connect to test redis");
        Self { container, url, conn }
    }

    fn connection_config_for(url: &str) -> ConnectionConfig {
        ConnectionConfig {
            account_endpoint: url.to_string(),
            auth_key: None,
            database_name: DATABASE.to_string(),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        Self::connection_config_for(&self.url)
    }

    /// Source feed adapter for `container`, partition key at `/pk`.
    pub fn feed(&self, container: &str) -> RedisChangeFeed {
        RedisChangeFeed::new(self.conn.clone(), container_namespace(DATABASE, container), "/pk")
    }

    /// Destination adapter for `container`.
    pub fn destination(&self, container: &str) -> RedisDestination {
        RedisDestination::new(self.conn.clone(), container_namespace(DATABASE, container), 2 * 1024 * 1024)
    }

    /// Append a raw stream entry, bypassing the producer helpers.
    pub async fn xadd_raw(&self, container: &str, partition_id: &str, fields: &[(&str, &[u8])]) -> String {
        let feed = self.feed(container);
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(feed.partitions_key())
            .arg(partition_id)
            .query_async(&mut conn)
            .await
            .expect("SADD");
        redis::cmd("XADD")
            .arg(feed.stream_key(partition_id))
            .arg("*")
            .arg(fields)
            .query_async(&mut conn)
            .await
            .expect("XADD")
    }
}
