//! Transfer request shape and structural checks.

use crate::model::Originator;
use crate::proto::channel_transfer::{
    GeneralParams, TransferBeginAdminRequest, TransferBeginCustomerRequest,
};

/// Longest accepted channel name.
const MAX_CHANNEL_NAME: usize = 64;

/// Request rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Method '{actual}' does not match endpoint (expected '{expected}')")]
    MethodMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("Malformed channel name: '{0}'")]
    MalformedChannel(String),

    #[error("Unknown channel: '{0}'")]
    UnknownChannel(String),

    #[error("Source and destination channel are both '{0}'")]
    SameChannel(String),

    #[error("Amount must be a positive integer, got '{0}'")]
    InvalidAmount(String),
}

/// A signed transfer request, independent of the endpoint it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub originator: Originator,
    pub method_name: String,
    pub request_id: String,
    pub chaincode: String,
    pub source_channel: String,
    pub nonce: String,
    pub public_key: String,
    pub signature: String,
    pub transfer_id: String,
    pub destination_channel: String,
    pub address: String,
    pub asset: String,
    pub amount: String,
}

impl TransferRequest {
    fn from_generals(originator: Originator, generals: GeneralParams) -> Self {
        Self {
            originator,
            method_name: generals.method_name,
            request_id: generals.request_id,
            chaincode: generals.chaincode,
            source_channel: generals.channel,
            nonce: generals.nonce,
            public_key: generals.public_key,
            signature: generals.sign,
            transfer_id: String::new(),
            destination_channel: String::new(),
            address: String::new(),
            asset: String::new(),
            amount: String::new(),
        }
    }

    pub fn from_customer(request: TransferBeginCustomerRequest) -> Result<Self, ValidationError> {
        let generals = request
            .generals
            .ok_or(ValidationError::MissingField("generals"))?;
        Ok(Self {
            transfer_id: request.id_transfer,
            destination_channel: request.channel_to,
            address: request.address,
            asset: request.token,
            amount: request.amount,
            ..Self::from_generals(Originator::Customer, generals)
        })
    }

    pub fn from_admin(request: TransferBeginAdminRequest) -> Result<Self, ValidationError> {
        let generals = request
            .generals
            .ok_or(ValidationError::MissingField("generals"))?;
        Ok(Self {
            transfer_id: request.id_transfer,
            destination_channel: request.channel_to,
            address: request.address,
            asset: request.token,
            amount: request.amount,
            ..Self::from_generals(Originator::Admin, generals)
        })
    }
}

/// Check everything that needs neither the store nor cryptography.
///
/// `is_known_channel` decides whether a channel is served by this instance.
pub fn validate_request(
    request: &TransferRequest,
    is_known_channel: impl Fn(&str) -> bool,
) -> Result<(), ValidationError> {
    let expected_method = request.originator.method_name();
    if request.method_name != expected_method {
        return Err(ValidationError::MethodMismatch {
            expected: expected_method,
            actual: request.method_name.clone(),
        });
    }

    let mut required = vec![
        ("request_id", &request.request_id),
        ("chaincode", &request.chaincode),
        ("nonce", &request.nonce),
        ("public_key", &request.public_key),
        ("sign", &request.signature),
        ("id_transfer", &request.transfer_id),
        ("token", &request.asset),
    ];
    // Customers may leave the address empty; it is then derived from the key.
    if request.originator == Originator::Admin {
        required.push(("address", &request.address));
    }
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
    }

    for channel in [&request.source_channel, &request.destination_channel] {
        if !is_well_formed_channel(channel) {
            return Err(ValidationError::MalformedChannel(channel.clone()));
        }
        if !is_known_channel(channel) {
            return Err(ValidationError::UnknownChannel(channel.clone()));
        }
    }
    if request
        .source_channel
        .eq_ignore_ascii_case(&request.destination_channel)
    {
        return Err(ValidationError::SameChannel(request.source_channel.clone()));
    }

    if !is_positive_integer(&request.amount) {
        return Err(ValidationError::InvalidAmount(request.amount.clone()));
    }
    Ok(())
}

fn is_well_formed_channel(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Decimal digits only, not all zeros. Amounts may exceed any native integer.
fn is_positive_integer(amount: &str) -> bool {
    !amount.is_empty()
        && amount.bytes().all(|b| b.is_ascii_digit())
        && amount.bytes().any(|b| b != b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_request() -> TransferRequest {
        TransferRequest {
            originator: Originator::Admin,
            method_name: "channelTransferByAdmin".to_string(),
            request_id: "req-1".to_string(),
            chaincode: "fiat".to_string(),
            source_channel: "fiat".to_string(),
            nonce: "1700000000000".to_string(),
            public_key: "key".to_string(),
            signature: "sig".to_string(),
            transfer_id: "t1".to_string(),
            destination_channel: "cc".to_string(),
            address: "addr".to_string(),
            asset: "FIAT".to_string(),
            amount: "250".to_string(),
        }
    }

    fn known(channel: &str) -> bool {
        matches!(channel.to_ascii_lowercase().as_str(), "cc" | "fiat")
    }

    #[test]
    fn test_valid_request_passes() {
        assert_eq!(validate_request(&admin_request(), known), Ok(()));
    }

    #[test]
    fn test_method_must_match_endpoint() {
        let mut request = admin_request();
        request.method_name = "channelTransferByCustomer".to_string();
        assert!(matches!(
            validate_request(&request, known),
            Err(ValidationError::MethodMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_transfer_id() {
        let mut request = admin_request();
        request.transfer_id = " ".to_string();
        assert_eq!(
            validate_request(&request, known),
            Err(ValidationError::MissingField("id_transfer"))
        );
    }

    #[test]
    fn test_customer_address_is_optional() {
        let mut request = admin_request();
        request.originator = Originator::Customer;
        request.method_name = "channelTransferByCustomer".to_string();
        request.address.clear();
        assert_eq!(validate_request(&request, known), Ok(()));
    }

    #[test]
    fn test_channel_checks() {
        let mut request = admin_request();
        request.destination_channel = "c c".to_string();
        assert!(matches!(
            validate_request(&request, known),
            Err(ValidationError::MalformedChannel(_))
        ));

        request.destination_channel = "industrial".to_string();
        assert_eq!(
            validate_request(&request, known),
            Err(ValidationError::UnknownChannel("industrial".to_string()))
        );

        request.destination_channel = "fiat".to_string();
        assert_eq!(
            validate_request(&request, known),
            Err(ValidationError::SameChannel("fiat".to_string()))
        );

        request.destination_channel = "FIAT".to_string();
        assert_eq!(
            validate_request(&request, known),
            Err(ValidationError::SameChannel("fiat".to_string()))
        );

        request.destination_channel = "CC".to_string();
        assert_eq!(validate_request(&request, known), Ok(()));
    }

    #[test]
    fn test_amount_must_be_positive_integer() {
        for bad in ["", "0", "000", "-5", "1.5", "1e3", "+7"] {
            let mut request = admin_request();
            request.amount = bad.to_string();
            assert!(
                matches!(
                    validate_request(&request, known),
                    Err(ValidationError::InvalidAmount(_))
                ),
                "amount {:?} accepted",
                bad
            );
        }

        let mut request = admin_request();
        request.amount = "340282366920938463463374607431768211456".to_string();
        assert_eq!(validate_request(&request, known), Ok(()));
    }
}
