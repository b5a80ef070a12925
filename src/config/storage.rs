//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Redis storage configuration.
///
/// With no addresses configured the service falls back to the in-memory
/// store, which does not survive restarts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStorageConfig {
    /// Redis addresses (`host:port`). Only the first one is used.
    pub addr: Vec<String>,
    /// Key prefix for transfer records, request index and nonces.
    #[serde(alias = "dbPrefix", alias = "dbprefix")]
    pub db_prefix: String,
    /// Redis password. Empty for none.
    pub password: String,
    /// Retention of a record after it reaches a terminal status.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "afterTransferTTL", alias = "aftertransferttl")]
    pub after_transfer_ttl: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            addr: Vec::new(),
            db_prefix: "transfer".to_string(),
            password: String::new(),
            after_transfer_ttl: Duration::from_secs(3600),
        }
    }
}

impl RedisStorageConfig {
    /// Connection URL for the first configured address, if any.
    pub fn url(&self) -> Option<String> {
        let addr = self.addr.first()?;
        if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            return Some(addr.clone());
        }
        if self.password.is_empty() {
            Some(format!("redis://{}", addr))
        } else {
            Some(format!("redis://:{}@{}", self.password, addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_storage_default() {
        let storage = RedisStorageConfig::default();
        assert!(storage.addr.is_empty());
        assert_eq!(storage.db_prefix, "transfer");
        assert_eq!(storage.after_transfer_ttl, Duration::from_secs(3600));
        assert!(storage.url().is_none());
    }

    #[test]
    fn test_redis_url_with_password() {
        let storage = RedisStorageConfig {
            addr: vec!["localhost:6379".to_string()],
            password: "secret".to_string(),
            ..Default::default()
        };
        assert_eq!(
            storage.url().as_deref(),
            Some("redis://:secret@localhost:6379")
        );
    }

    #[test]
    fn test_redis_url_passthrough() {
        let storage = RedisStorageConfig {
            addr: vec!["redis://cache:6380".to_string()],
            ..Default::default()
        };
        assert_eq!(storage.url().as_deref(), Some("redis://cache:6380"));
    }
}
