//! Transfer storage.
//!
//! A key-value store with per-key TTL holding four key spaces:
//! transfer records, the request-id index, submission preimages and nonce
//! markers (see [`KeySpace`]). The store is the single source of truth for
//! transfer state; every status change goes through [`TransferStore::update`],
//! a conditional write guarded by the expected previous status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RedisStorageConfig};
use crate::model::{SubmissionPreimage, TransferRecord, TransferStatus, TransitionError};

mod keys;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use keys::KeySpace;
pub use memory::MemoryTransferStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisTransferStore;

/// Outcome of [`TransferStore::claim_nonce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceClaim {
    Claimed,
    /// Already used; carries the request id that claimed it, if still known.
    Taken(Option<String>),
}

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Transfer not found: {0}")]
    NotFound(String),

    #[error("Status conflict for {transfer_id}: expected {expected}, found {actual}")]
    Conflict {
        transfer_id: String,
        expected: TransferStatus,
        actual: TransferStatus,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StorageError {
    /// Whether the same operation may succeed when tried again later.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Conflict { .. } => true,
            #[cfg(feature = "redis")]
            StorageError::Redis(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Interface for transfer persistence.
///
/// Implementations:
/// - `MemoryTransferStore`: in-process map with lazy expiry and a sweep
/// - `RedisTransferStore`: durable, native TTL, Lua-scripted conditional update
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Store a new record and index its request id.
    ///
    /// Create-if-absent: returns `false` without writing when a record with
    /// the same transfer id already exists.
    async fn create(&self, record: &TransferRecord) -> Result<bool>;

    /// Read a record. Expired records read as `None`.
    async fn get(&self, transfer_id: &str) -> Result<Option<TransferRecord>>;

    /// Transfer id created by `request_id`, if that request was seen.
    async fn transfer_for_request(&self, request_id: &str) -> Result<Option<String>>;

    /// Replace a record if its stored status still equals `expected`.
    ///
    /// Fails with `StorageError::Conflict` when another writer moved the
    /// record first and `StorageError::NotFound` when it is gone. When
    /// `record` is terminal the record, its preimage and its request index
    /// entry all receive the record's remaining TTL.
    async fn update(&self, expected: TransferStatus, record: &TransferRecord) -> Result<()>;

    /// Create-if-absent of the submission preimage.
    async fn put_preimage(&self, preimage: &SubmissionPreimage) -> Result<bool>;

    /// Read the submission preimage of a transfer.
    async fn get_preimage(&self, transfer_id: &str) -> Result<Option<SubmissionPreimage>>;

    /// Record first use of `nonce` by `signer` on behalf of `request_id`.
    async fn claim_nonce(
        &self,
        signer: &str,
        nonce: u64,
        request_id: &str,
        ttl: Duration,
    ) -> Result<NonceClaim>;

    /// All records that have not reached a terminal status.
    async fn list_unfinished(&self) -> Result<Vec<TransferRecord>>;

    /// Physically remove expired entries. Returns the number removed.
    async fn evict_expired(&self) -> Result<usize>;
}

/// Initialize storage based on configuration.
///
/// Uses Redis when an address is configured, otherwise the in-memory store.
pub async fn init_storage(config: &Config) -> Result<Arc<dyn TransferStore>> {
    let keys = KeySpace::new(
        &config.redis_storage.db_prefix,
        &config.options.batch_tx_preimage_prefix,
    );
    init_with_keys(&config.redis_storage, keys).await
}

#[cfg(feature = "redis")]
async fn init_with_keys(
    config: &RedisStorageConfig,
    keys: KeySpace,
) -> Result<Arc<dyn TransferStore>> {
    match config.url() {
        Some(url) => {
            let store = RedisTransferStore::new(&url, keys).await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No redis address configured, using in-memory store (state lost on restart)");
            Ok(Arc::new(MemoryTransferStore::new(keys)))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn init_with_keys(
    config: &RedisStorageConfig,
    keys: KeySpace,
) -> Result<Arc<dyn TransferStore>> {
    if !config.addr.is_empty() {
        warn!("Redis configured but 'redis' feature is not enabled, using in-memory store");
    } else {
        warn!("No redis address configured, using in-memory store (state lost on restart)");
    }
    Ok(Arc::new(MemoryTransferStore::new(keys)))
}

/// Run `evict_expired` every `interval` until cancelled.
pub fn spawn_eviction_sweep(
    store: Arc<dyn TransferStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?interval, "Starting eviction sweep");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match store.evict_expired().await {
                Ok(0) => {}
                Ok(evicted) => debug!(evicted, "Evicted expired entries"),
                Err(e) => warn!(error = %e, "Eviction sweep failed"),
            }
        }
        info!("Eviction sweep stopped");
    })
}
