//! Key layout shared by all store backends.

/// Namespaced keys for the four entity kinds.
///
/// ```text
/// {db_prefix}:transfer:{transfer_id}     transfer record (JSON)
/// {db_prefix}:request:{request_id}       transfer id created by the request
/// {db_prefix}:nonce:{signer}:{nonce}     nonce marker
/// {preimage_prefix}:{transfer_id}        submission preimage (JSON)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    db_prefix: String,
    preimage_prefix: String,
}

impl KeySpace {
    pub fn new(db_prefix: &str, preimage_prefix: &str) -> Self {
        Self {
            db_prefix: db_prefix.to_string(),
            preimage_prefix: preimage_prefix.to_string(),
        }
    }

    pub fn record(&self, transfer_id: &str) -> String {
        format!("{}:transfer:{}", self.db_prefix, transfer_id)
    }

    /// Pattern matching every record key.
    pub fn record_pattern(&self) -> String {
        format!("{}:transfer:*", self.db_prefix)
    }

    /// Prefix shared by every record key.
    pub fn record_prefix(&self) -> String {
        format!("{}:transfer:", self.db_prefix)
    }

    pub fn request(&self, request_id: &str) -> String {
        format!("{}:request:{}", self.db_prefix, request_id)
    }

    pub fn nonce(&self, signer: &str, nonce: u64) -> String {
        format!("{}:nonce:{}:{}", self.db_prefix, signer, nonce)
    }

    pub fn preimage(&self, transfer_id: &str) -> String {
        format!("{}:{}", self.preimage_prefix, transfer_id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("transfer", "batchTransactions")
    }
}
