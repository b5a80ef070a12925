//! Redis TransferStore implementation.
//!
//! Records and preimages are JSON strings. Terminal records, their preimage
//! and their request index entry carry a native `PX` expiry, so Redis evicts
//! them itself. Conditional updates run as a Lua script so the status check
//! and the write are one atomic step.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::model::{SubmissionPreimage, TransferRecord, TransferStatus};
use crate::storage::{KeySpace, NonceClaim, Result, StorageError, TransferStore};

/// KEYS: record, preimage, request index.
/// ARGV: expected status, new record JSON, TTL in ms (0 = persistent).
/// Returns `{0, ''}` when missing, `{2, actual}` on mismatch, `{1, expected}` on write.
const CONDITIONAL_UPDATE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {0, ''}
end
local status = cjson.decode(current)['status']
if status ~= ARGV[1] then
  return {2, status}
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
  redis.call('PEXPIRE', KEYS[2], ttl)
  redis.call('PEXPIRE', KEYS[3], ttl)
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return {1, status}
"#;

const SCAN_BATCH: usize = 200;

/// Redis transfer store.
pub struct RedisTransferStore {
    conn: ConnectionManager,
    keys: KeySpace,
    update_script: Script,
}

impl RedisTransferStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379/0)
    /// * `keys` - key layout for records, indexes, preimages and nonces
    pub async fn new(url: &str, keys: KeySpace) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %redact(url), "Connected to Redis for transfer storage");

        Ok(Self {
            conn,
            keys,
            update_script: Script::new(CONDITIONAL_UPDATE),
        })
    }

    fn decode_record(key: &str, value: &str) -> Result<TransferRecord> {
        serde_json::from_str(value).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// `SET key value NX [PX ttl]`, true when the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }
}

/// Drop the password from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl TransferStore for RedisTransferStore {
    async fn create(&self, record: &TransferRecord) -> Result<bool> {
        let value = serde_json::to_string(record)?;
        let key = self.keys.record(&record.transfer_id);

        if !self.set_if_absent(&key, &value, None).await? {
            debug!(transfer_id = %record.transfer_id, "Record already exists");
            return Ok(false);
        }
        self.set_if_absent(
            &self.keys.request(&record.request_id),
            &record.transfer_id,
            None,
        )
        .await?;

        debug!(transfer_id = %record.transfer_id, "Created transfer record in Redis");
        Ok(true)
    }

    async fn get(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        let key = self.keys.record(transfer_id);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.get(&key).await?;
        value.map(|v| Self::decode_record(&key, &v)).transpose()
    }

    async fn transfer_for_request(&self, request_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(self.keys.request(request_id)).await?;
        Ok(id)
    }

    async fn update(&self, expected: TransferStatus, record: &TransferRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        let ttl_ms = if record.status.is_terminal() {
            record
                .remaining_ttl(Utc::now())
                .map(ttl_millis)
                .unwrap_or(0)
        } else {
            0
        };

        let mut conn = self.conn.clone();
        let (code, actual): (i64, String) = self
            .update_script
            .key(self.keys.record(&record.transfer_id))
            .key(self.keys.preimage(&record.transfer_id))
            .key(self.keys.request(&record.request_id))
            .arg(expected.as_str())
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => {
                debug!(
                    transfer_id = %record.transfer_id,
                    from = %expected,
                    to = %record.status,
                    "Updated transfer record in Redis"
                );
                Ok(())
            }
            0 => Err(StorageError::NotFound(record.transfer_id.clone())),
            _ => {
                let actual = actual.parse().map_err(|reason| StorageError::Corrupt {
                    key: self.keys.record(&record.transfer_id),
                    reason,
                })?;
                Err(StorageError::Conflict {
                    transfer_id: record.transfer_id.clone(),
                    expected,
                    actual,
                })
            }
        }
    }

    async fn put_preimage(&self, preimage: &SubmissionPreimage) -> Result<bool> {
        let value = serde_json::to_string(preimage)?;
        self.set_if_absent(&self.keys.preimage(&preimage.transfer_id), &value, None)
            .await
    }

    async fn get_preimage(&self, transfer_id: &str) -> Result<Option<SubmissionPreimage>> {
        let key = self.keys.preimage(transfer_id);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.get(&key).await?;
        value
            .map(|v| {
                serde_json::from_str(&v).map_err(|e| StorageError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    async fn claim_nonce(
        &self,
        signer: &str,
        nonce: u64,
        request_id: &str,
        ttl: Duration,
    ) -> Result<NonceClaim> {
        let key = self.keys.nonce(signer, nonce);
        if self.set_if_absent(&key, request_id, Some(ttl)).await? {
            return Ok(NonceClaim::Claimed);
        }
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(&key).await?;
        Ok(NonceClaim::Taken(holder))
    }

    async fn list_unfinished(&self) -> Result<Vec<TransferRecord>> {
        let mut conn = self.conn.clone();
        let pattern = self.keys.record_pattern();
        let mut cursor: u64 = 0;
        let mut records = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                // Keys may expire between SCAN and GET.
                let value: Option<String> = conn.get(&key).await?;
                if let Some(value) = value {
                    let record = Self::decode_record(&key, &value)?;
                    if !record.status.is_terminal() {
                        records.push(record);
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(count = records.len(), "Scanned unfinished transfers");
        Ok(records)
    }

    async fn evict_expired(&self) -> Result<usize> {
        // Redis expires keys natively.
        Ok(0)
    }
}
