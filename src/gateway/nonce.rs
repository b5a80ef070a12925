//! Nonce freshness and replay protection.
//!
//! A nonce is the signer's clock in milliseconds since the Unix epoch. It
//! must lie within the freshness window around now and may be used once per
//! signer; claims are kept for twice the window, after which the nonce is
//! stale anyway. A claim remembers the request id that made it, so a
//! replay can be told apart from the same request arriving twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::storage::{NonceClaim, StorageError, TransferStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NonceError {
    #[error("Malformed nonce: '{0}'")]
    Malformed(String),

    #[error("Nonce {nonce} is outside the freshness window")]
    Stale { nonce: u64 },

    #[error("Nonce {nonce} was already used")]
    Replayed {
        nonce: u64,
        /// Request id that used the nonce first.
        holder: Option<String>,
    },
}

pub fn parse_nonce(raw: &str) -> Result<u64, NonceError> {
    raw.parse()
        .map_err(|_| NonceError::Malformed(raw.to_string()))
}

/// Whether `nonce` lies within `window` of `now_ms` in either direction.
pub fn is_fresh(nonce: u64, now_ms: u64, window: Duration) -> bool {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    nonce.abs_diff(now_ms) <= window_ms
}

/// Nonce checks backed by the store's nonce markers.
pub struct NonceGuard {
    store: Arc<dyn TransferStore>,
    window: Duration,
}

impl NonceGuard {
    pub fn new(store: Arc<dyn TransferStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Validate and consume `raw` for `signer` on behalf of `request_id`.
    ///
    /// The outer error is a store failure, the inner one a rejected nonce.
    pub async fn claim(
        &self,
        signer: &str,
        raw: &str,
        request_id: &str,
    ) -> Result<Result<(), NonceError>, StorageError> {
        let nonce = match parse_nonce(raw) {
            Ok(nonce) => nonce,
            Err(e) => return Ok(Err(e)),
        };

        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        if !is_fresh(nonce, now_ms, self.window) {
            return Ok(Err(NonceError::Stale { nonce }));
        }

        let claim = self
            .store
            .claim_nonce(signer, nonce, request_id, self.window.saturating_mul(2))
            .await?;
        match claim {
            NonceClaim::Claimed => Ok(Ok(())),
            NonceClaim::Taken(holder) => Ok(Err(NonceError::Replayed { nonce, holder })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeySpace, MemoryTransferStore};

    #[test]
    fn test_parse_nonce() {
        assert_eq!(parse_nonce("1700000000000"), Ok(1_700_000_000_000));
        assert!(matches!(parse_nonce("abc"), Err(NonceError::Malformed(_))));
        assert!(matches!(parse_nonce("-1"), Err(NonceError::Malformed(_))));
    }

    #[test]
    fn test_freshness_window_is_symmetric() {
        let window = Duration::from_secs(10);
        let now = 1_000_000;
        assert!(is_fresh(now, now, window));
        assert!(is_fresh(now - 10_000, now, window));
        assert!(is_fresh(now + 10_000, now, window));
        assert!(!is_fresh(now - 10_001, now, window));
        assert!(!is_fresh(now + 10_001, now, window));
    }

    #[tokio::test]
    async fn test_claim_rejects_stale_and_replayed() {
        let store = Arc::new(MemoryTransferStore::new(KeySpace::default()));
        let guard = NonceGuard::new(store, Duration::from_secs(60));
        let now = Utc::now().timestamp_millis().to_string();

        assert_eq!(guard.claim("signer", &now, "r1").await.unwrap(), Ok(()));
        assert_eq!(
            guard.claim("signer", &now, "r2").await.unwrap(),
            Err(NonceError::Replayed {
                nonce: now.parse().unwrap(),
                holder: Some("r1".to_string()),
            })
        );
        assert_eq!(guard.claim("other", &now, "r2").await.unwrap(), Ok(()));

        assert!(matches!(
            guard.claim("signer", "1", "r3").await.unwrap(),
            Err(NonceError::Stale { nonce: 1 })
        ));
    }
}
