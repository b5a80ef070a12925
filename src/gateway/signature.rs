//! Request signatures.
//!
//! A request is signed over the SHA-256 digest of its fields concatenated in
//! a fixed order:
//!
//! ```text
//! admin:    method, request_id, chaincode, channel, transfer_id, channel_to, address, token, amount, nonce
//! customer: method, request_id, chaincode, channel, transfer_id, channel_to, token, amount, nonce
//! ```
//!
//! Public keys and signatures travel base58 encoded. A signer's address is
//! the base58 encoding of the SHA-256 digest of its public key.

use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use sha2::{Digest, Sha256};

use super::validation::TransferRequest;
use crate::model::Originator;

/// Signature check failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidEncoding(String),

    #[error("Signature does not match request")]
    Mismatch,
}

/// Verifies request signatures and derives signer addresses.
pub trait SignatureVerifier: Send + Sync {
    /// Check `signature` over `message` by `public_key` (both base58).
    fn verify(&self, public_key: &str, message: &[u8], signature: &str)
        -> Result<(), SignatureError>;

    /// Address owned by `public_key`.
    fn address_of(&self, public_key: &str) -> Result<String, SignatureError>;
}

/// Ed25519 verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    fn decode_key(public_key: &str) -> Result<VerifyingKey, SignatureError> {
        let bytes = bs58::decode(public_key)
            .into_vec()
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignatureError::InvalidPublicKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        public_key: &str,
        message: &[u8],
        signature: &str,
    ) -> Result<(), SignatureError> {
        let key = Self::decode_key(public_key)?;
        let bytes = bs58::decode(signature)
            .into_vec()
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        key.verify(message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn address_of(&self, public_key: &str) -> Result<String, SignatureError> {
        let key = Self::decode_key(public_key)?;
        Ok(address_from_key_bytes(key.as_bytes()))
    }
}

/// Address for raw public key bytes.
pub fn address_from_key_bytes(public_key: &[u8]) -> String {
    bs58::encode(Sha256::digest(public_key)).into_string()
}

/// Fields covered by the signature, in signing order.
pub fn signed_fields(request: &TransferRequest) -> Vec<&str> {
    let mut fields = vec![
        request.method_name.as_str(),
        request.request_id.as_str(),
        request.chaincode.as_str(),
        request.source_channel.as_str(),
        request.transfer_id.as_str(),
        request.destination_channel.as_str(),
    ];
    if request.originator == Originator::Admin {
        fields.push(request.address.as_str());
    }
    fields.extend([
        request.asset.as_str(),
        request.amount.as_str(),
        request.nonce.as_str(),
    ]);
    fields
}

/// Digest the signature is computed over.
pub fn signed_message(request: &TransferRequest) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for field in signed_fields(request) {
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    fn request(originator: Originator) -> TransferRequest {
        TransferRequest {
            originator,
            method_name: originator.method_name().to_string(),
            request_id: "req-1".to_string(),
            chaincode: "fiat".to_string(),
            source_channel: "fiat".to_string(),
            nonce: "1700000000000".to_string(),
            public_key: String::new(),
            signature: String::new(),
            transfer_id: "t1".to_string(),
            destination_channel: "cc".to_string(),
            address: "addr".to_string(),
            asset: "FIAT".to_string(),
            amount: "250".to_string(),
        }
    }

    #[test]
    fn test_field_order() {
        let admin = request(Originator::Admin);
        assert_eq!(
            signed_fields(&admin),
            vec![
                "channelTransferByAdmin",
                "req-1",
                "fiat",
                "fiat",
                "t1",
                "cc",
                "addr",
                "FIAT",
                "250",
                "1700000000000"
            ]
        );

        let customer = request(Originator::Customer);
        assert!(!signed_fields(&customer).contains(&"addr"));
        assert_eq!(signed_fields(&customer).len(), 9);
    }

    #[test]
    fn test_verify_roundtrip_and_tamper() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let public_key = bs58::encode(key.verifying_key().as_bytes()).into_string();

        let mut req = request(Originator::Admin);
        let signature = key.sign(&signed_message(&req));
        let encoded = bs58::encode(signature.to_bytes()).into_string();

        let verifier = Ed25519Verifier;
        assert_eq!(
            verifier.verify(&public_key, &signed_message(&req), &encoded),
            Ok(())
        );

        req.amount = "251".to_string();
        assert_eq!(
            verifier.verify(&public_key, &signed_message(&req), &encoded),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_bad_encodings() {
        let verifier = Ed25519Verifier;
        assert!(matches!(
            verifier.verify("0OIl", b"msg", "sig"),
            Err(SignatureError::InvalidPublicKey(_))
        ));

        let key = SigningKey::from_bytes(&[1u8; 32]);
        let public_key = bs58::encode(key.verifying_key().as_bytes()).into_string();
        assert!(matches!(
            verifier.verify(&public_key, b"msg", "abc"),
            Err(SignatureError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_address_derivation() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let public_key = bs58::encode(key.verifying_key().as_bytes()).into_string();
        let address = Ed25519Verifier.address_of(&public_key).unwrap();
        assert_eq!(address, address_from_key_bytes(key.verifying_key().as_bytes()));
        assert_ne!(address, public_key);
    }
}
