//! Configuration for the controller data plane.
//!
//! # Example
//!
//! ```
//! use controller_db::config::{ControllerConfig, ListenerMode, StatusMode};
//!
//! // Minimal config (postgres for everything)
//! let config = ControllerConfig {
//!     db_url: "postgres://controller@localhost/central".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.listen_mode, ListenerMode::Pgsql);
//! assert_eq!(config.status_mode, StatusMode::Pgsql);
//! assert_eq!(config.commit_workers, 4);
//! ```

use serde::Deserialize;

use crate::error::DbError;

/// Which transport delivers cross-instance change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// PostgreSQL LISTEN/NOTIFY channels.
    Pgsql,
    /// Redis streams, one per record kind.
    Redis,
    /// Hosted pub/sub topics with per-controller subscription filters.
    Pubsub,
}

/// Which backend absorbs batched member-liveness writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMode {
    Pgsql,
    Redis,
    Bigtable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub hostname: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// All keys for one controller share a `{controller}` hash tag, so the
    /// same key layout works against a cluster or a standalone instance.
    #[serde(default)]
    pub cluster_mode: bool,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/0", pw, self.hostname, self.port),
            None => format!("redis://{}:{}/0", self.hostname, self.port),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    pub project_id: String,
    #[serde(default = "default_network_change_topic")]
    pub network_change_topic: String,
    #[serde(default = "default_member_change_topic")]
    pub member_change_topic: String,
    #[serde(default)]
    pub member_status_topic: Option<String>,
    /// Deployment slice tag attached to published changes.
    #[serde(default)]
    pub frontend: Option<String>,
}

fn default_network_change_topic() -> String {
    "controller-network-change-stream".to_string()
}

fn default_member_change_topic() -> String {
    "controller-member-change-stream".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BigTableConfig {
    pub project_id: String,
    pub instance_id: String,
    pub table_id: String,
}

/// Top-level configuration.
///
/// `listen_mode` and `status_mode` select exactly one listener and one status
/// sink; modes that need redis / pub-sub / bigtable settings fail validation
/// when those settings are absent rather than falling through to another
/// mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// PostgreSQL connection string for the store of record.
    pub db_url: String,

    #[serde(rename = "listenMode")]
    pub listen_mode: ListenerMode,
    #[serde(rename = "statusMode")]
    pub status_mode: StatusMode,

    #[serde(rename = "redisConfig")]
    pub redis: Option<RedisConfig>,
    #[serde(rename = "pubSubConfig")]
    pub pub_sub: Option<PubSubConfig>,
    #[serde(rename = "bigTableConfig")]
    pub big_table: Option<BigTableConfig>,

    #[serde(rename = "ssoEnabled")]
    pub sso_enabled: bool,

    /// Number of commit workers draining the write-behind queue.
    pub commit_workers: usize,

    /// Store connection pool bounds.
    pub pool_max_connections: u32,
    pub pool_min_connections: u32,
    /// Seconds a borrow may wait before failing with pool exhaustion.
    pub pool_acquire_timeout_secs: u64,

    /// Seconds between liveness flushes.
    pub online_flush_interval_secs: u64,
    /// Seconds between controller heartbeat upserts.
    pub heartbeat_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            db_url: String::new(),
            listen_mode: ListenerMode::Pgsql,
            status_mode: StatusMode::Pgsql,
            redis: None,
            pub_sub: None,
            big_table: None,
            sso_enabled: false,
            commit_workers: 4,
            pool_max_connections: 15,
            pool_min_connections: 5,
            pool_acquire_timeout_secs: 3,
            online_flush_interval_secs: 10,
            heartbeat_interval_secs: 1,
        }
    }
}

impl ControllerConfig {
    /// Check mode/backend consistency before anything connects.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.db_url.is_empty() {
            return Err(DbError::Config("db_url is required".into()));
        }
        if self.listen_mode == ListenerMode::Redis && self.redis.is_none() {
            return Err(DbError::Config(
                "redis listener mode selected but no redis configuration provided".into(),
            ));
        }
        if self.listen_mode == ListenerMode::Pubsub && self.pub_sub.is_none() {
            return Err(DbError::Config(
                "pubsub listener mode selected but no pubsub configuration provided".into(),
            ));
        }
        if self.status_mode == StatusMode::Redis && self.redis.is_none() {
            return Err(DbError::Config(
                "redis status mode selected but no redis configuration provided".into(),
            ));
        }
        if self.status_mode == StatusMode::Bigtable && self.big_table.is_none() {
            return Err(DbError::Config(
                "bigtable status mode selected but no bigtable configuration provided".into(),
            ));
        }
        if self.commit_workers == 0 {
            return Err(DbError::Config("commit_workers must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ControllerConfig {
        ControllerConfig {
            db_url: "postgres://controller@localhost/central".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let c = ControllerConfig::default();
        assert_eq!(c.listen_mode, ListenerMode::Pgsql);
        assert_eq!(c.status_mode, StatusMode::Pgsql);
        assert_eq!(c.commit_workers, 4);
        assert_eq!(c.pool_max_connections, 15);
        assert_eq!(c.pool_min_connections, 5);
        assert_eq!(c.online_flush_interval_secs, 10);
        assert_eq!(c.heartbeat_interval_secs, 1);
    }

    #[test]
    fn test_parse_modes_from_json() {
        let c: ControllerConfig = serde_json::from_str(
            r#"{
                "db_url": "postgres://x/y",
                "listenMode": "redis",
                "statusMode": "bigtable",
                "redisConfig": {"hostname": "redis.internal"},
                "bigTableConfig": {
                    "project_id": "p", "instance_id": "i", "table_id": "t"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(c.listen_mode, ListenerMode::Redis);
        assert_eq!(c.status_mode, StatusMode::Bigtable);
        assert_eq!(c.redis.as_ref().unwrap().port, 6379);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_redis_mode_requires_redis_config() {
        let c = ControllerConfig {
            listen_mode: ListenerMode::Redis,
            ..base()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_pubsub_mode_requires_pubsub_config() {
        let c = ControllerConfig {
            listen_mode: ListenerMode::Pubsub,
            ..base()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_bigtable_status_requires_bigtable_config() {
        let c = ControllerConfig {
            status_mode: StatusMode::Bigtable,
            ..base()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_missing_db_url_rejected() {
        assert!(ControllerConfig::default().validate().is_err());
    }

    #[test]
    fn test_redis_url_with_password() {
        let rc = RedisConfig {
            hostname: "cache".into(),
            port: 6380,
            password: Some("hunter2".into()),
            cluster_mode: false,
        };
        assert_eq!(rc.url(), "redis://:hunter2@cache:6380/0");

        let rc = RedisConfig {
            hostname: "cache".into(),
            port: 6379,
            password: None,
            cluster_mode: true,
        };
        assert_eq!(rc.url(), "redis://cache:6379/0");
    }
}
