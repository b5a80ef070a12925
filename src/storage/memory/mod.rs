//! In-memory TransferStore.
//!
//! Emulates a TTL key-value server inside the process: values are stored
//! under the same [`KeySpace`] layout and JSON encoding as the Redis backend,
//! expired keys read as absent, and `evict_expired` removes them physically.
//! Deadlines use `tokio::time::Instant` so tests can drive expiry with paused
//! time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{KeySpace, NonceClaim, Result, StorageError, TransferStore};
use crate::model::{SubmissionPreimage, TransferRecord, TransferStatus};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Map-backed store for standalone runs and tests.
#[derive(Default)]
pub struct MemoryTransferStore {
    keys: KeySpace,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryTransferStore {
    pub fn new(keys: KeySpace) -> Self {
        Self {
            keys,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys currently held, expired or not.
    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn read_live(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone())
    }
}

fn decode_record(key: &str, value: &str) -> Result<TransferRecord> {
    serde_json::from_str(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Insert unless a live entry already holds `key`.
fn insert_if_absent(
    entries: &mut HashMap<String, Entry>,
    key: String,
    entry: Entry,
    now: Instant,
) -> bool {
    if entries.get(&key).is_some_and(|e| e.is_live(now)) {
        return false;
    }
    entries.insert(key, entry);
    true
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn create(&self, record: &TransferRecord) -> Result<bool> {
        let value = serde_json::to_string(record)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !insert_if_absent(
            &mut entries,
            self.keys.record(&record.transfer_id),
            Entry::new(value),
            now,
        ) {
            return Ok(false);
        }
        insert_if_absent(
            &mut entries,
            self.keys.request(&record.request_id),
            Entry::new(record.transfer_id.clone()),
            now,
        );
        Ok(true)
    }

    async fn get(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        let key = self.keys.record(transfer_id);
        match self.read_live(&key).await {
            Some(value) => decode_record(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn transfer_for_request(&self, request_id: &str) -> Result<Option<String>> {
        Ok(self.read_live(&self.keys.request(request_id)).await)
    }

    async fn update(&self, expected: TransferStatus, record: &TransferRecord) -> Result<()> {
        let key = self.keys.record(&record.transfer_id);
        let value = serde_json::to_string(record)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = match entries.get(&key).filter(|e| e.is_live(now)) {
            Some(entry) => decode_record(&key, &entry.value)?,
            None => return Err(StorageError::NotFound(record.transfer_id.clone())),
        };
        if current.status != expected {
            return Err(StorageError::Conflict {
                transfer_id: record.transfer_id.clone(),
                expected,
                actual: current.status,
            });
        }

        let deadline = if record.status.is_terminal() {
            record
                .remaining_ttl(Utc::now())
                .map(|ttl| now + ttl.max(Duration::from_millis(1)))
        } else {
            None
        };

        entries.insert(
            key,
            Entry {
                value,
                expires_at: deadline,
            },
        );
        if let Some(deadline) = deadline {
            for companion in [
                self.keys.preimage(&record.transfer_id),
                self.keys.request(&record.request_id),
            ] {
                if let Some(entry) = entries.get_mut(&companion) {
                    entry.expires_at = Some(deadline);
                }
            }
        }
        Ok(())
    }

    async fn put_preimage(&self, preimage: &SubmissionPreimage) -> Result<bool> {
        let value = serde_json::to_string(preimage)?;
        let mut entries = self.entries.write().await;
        Ok(insert_if_absent(
            &mut entries,
            self.keys.preimage(&preimage.transfer_id),
            Entry::new(value),
            Instant::now(),
        ))
    }

    async fn get_preimage(&self, transfer_id: &str) -> Result<Option<SubmissionPreimage>> {
        let key = self.keys.preimage(transfer_id);
        match self.read_live(&key).await {
            Some(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn claim_nonce(
        &self,
        signer: &str,
        nonce: u64,
        request_id: &str,
        ttl: Duration,
    ) -> Result<NonceClaim> {
        let now = Instant::now();
        let key = self.keys.nonce(signer, nonce);
        let mut entries = self.entries.write().await;

        if let Some(holder) = entries.get(&key).filter(|e| e.is_live(now)) {
            return Ok(NonceClaim::Taken(Some(holder.value.clone())));
        }
        entries.insert(
            key,
            Entry {
                value: request_id.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(NonceClaim::Claimed)
    }

    async fn list_unfinished(&self) -> Result<Vec<TransferRecord>> {
        let prefix = self.keys.record_prefix();
        let now = Instant::now();
        let entries = self.entries.read().await;

        let mut records = Vec::new();
        for (key, entry) in entries.iter() {
            if !key.starts_with(&prefix) || !entry.is_live(now) {
                continue;
            }
            let record = decode_record(key, &entry.value)?;
            if !record.status.is_terminal() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "Memory store eviction");
        }
        Ok(evicted)
    }
}
