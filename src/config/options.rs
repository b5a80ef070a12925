//! Pipeline tuning options.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Execution pipeline options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Key prefix for submission preimages.
    #[serde(alias = "batchTxPreimagePrefix", alias = "batchtxpreimageprefix")]
    pub batch_tx_preimage_prefix: String,
    /// Capacity of the collector's outcome intake buffer.
    #[serde(alias = "collectorsBufSize", alias = "collectorsbufsize")]
    pub collectors_buf_size: usize,
    /// Per-attempt deadline for a batcher submission. Zero waits indefinitely.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "executeTimeout", alias = "executetimeout")]
    pub execute_timeout: Duration,
    /// Total submission attempts before a transfer fails.
    #[serde(alias = "retryExecuteAttempts", alias = "retryexecuteattempts")]
    pub retry_execute_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "retryExecuteDelay", alias = "retryexecutedelay")]
    pub retry_execute_delay: Duration,
    /// Ceiling for the delay between attempts.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "retryExecuteMaxDelay", alias = "retryexecutemaxdelay")]
    pub retry_execute_max_delay: Duration,
    /// Nonce freshness window.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Transfers concurrently in flight per destination channel.
    #[serde(alias = "transfersInHandleOnChannel", alias = "transfersinhandleonchannel")]
    pub transfers_in_handle_on_channel: usize,
    /// Capacity of each channel's pending request buffer.
    #[serde(alias = "newestRequestStreamBufferSize", alias = "newestrequeststreambuffersize")]
    pub newest_request_stream_buffer_size: usize,
    /// How often an in-flight worker re-reads the store while awaiting settlement.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "settlePollInterval", alias = "settlepollinterval")]
    pub settle_poll_interval: Duration,
    /// Interval of the in-memory store's eviction sweep.
    #[serde(with = "humantime_serde")]
    #[serde(alias = "evictionInterval", alias = "evictioninterval")]
    pub eviction_interval: Duration,
    /// Base58 public keys allowed to call `TransferByAdmin`.
    #[serde(alias = "adminPublicKeys", alias = "adminpublickeys")]
    pub admin_public_keys: Vec<String>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            batch_tx_preimage_prefix: "batchTransactions".to_string(),
            collectors_buf_size: 1,
            execute_timeout: Duration::ZERO,
            retry_execute_attempts: 3,
            retry_execute_delay: Duration::from_millis(500),
            retry_execute_max_delay: Duration::from_secs(2),
            ttl: Duration::from_secs(10800),
            transfers_in_handle_on_channel: 50,
            newest_request_stream_buffer_size: 50,
            settle_poll_interval: Duration::from_secs(1),
            eviction_interval: Duration::from_secs(30),
            admin_public_keys: Vec::new(),
        }
    }
}

impl OptionsConfig {
    /// Retry policy for batcher submissions.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            base_delay: self.retry_execute_delay,
            max_delay: self.retry_execute_max_delay,
            max_attempts: self.retry_execute_attempts,
        }
    }

    /// Per-attempt deadline, `None` when unbounded.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (!self.execute_timeout.is_zero()).then_some(self.execute_timeout)
    }
}
