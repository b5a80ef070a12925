//! gRPC batcher client.

use async_trait::async_trait;
use futures::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::{Acceptance, BatcherClient, BatcherError, OutcomeStream, Submission};
use crate::model::SettlementOutcome;
use crate::proto::batcher::batcher_adapter_client::BatcherAdapterClient;
use crate::proto::batcher::{BatcherRequest, OutcomeSubscription, TransferOutcome};

/// Batcher reached over `core.batcher.BatcherAdapter`.
#[derive(Clone)]
pub struct GrpcBatcherClient {
    channel: String,
    client: BatcherAdapterClient<Channel>,
}

impl GrpcBatcherClient {
    /// Create a client for `channel`'s batcher at `address` ("host:port").
    ///
    /// The connection is established lazily, so an unreachable batcher shows
    /// up as a transient error on the first call rather than at startup.
    pub fn connect_lazy(channel: &str, address: &str) -> Result<Self, BatcherError> {
        if address.trim().is_empty() {
            return Err(BatcherError::Endpoint(format!(
                "no batcher address configured for channel '{}'",
                channel
            )));
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| BatcherError::Endpoint(e.to_string()))?;
        let client = BatcherAdapterClient::new(endpoint.connect_lazy());

        debug!(channel = %channel, address = %address, "Batcher client created");

        Ok(Self {
            channel: channel.to_string(),
            client,
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn to_outcome(channel: &str, outcome: TransferOutcome) -> SettlementOutcome {
    SettlementOutcome {
        transfer_id: outcome.transfer_id,
        channel: channel.to_string(),
        success: outcome.success,
        message: non_empty(outcome.message),
        tx_id: non_empty(outcome.tx_id),
    }
}

#[async_trait]
impl BatcherClient for GrpcBatcherClient {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn submit(&self, submission: &Submission) -> Result<Acceptance, BatcherError> {
        let request = BatcherRequest {
            request_id: submission.request_id.clone(),
            transfer_id: submission.transfer_id.clone(),
            channel: submission.channel.clone(),
            chaincode: submission.chaincode.clone(),
            method: submission.method.clone(),
            args: submission.args.clone(),
        };

        let response = self
            .client
            .clone()
            .submit_transaction(request)
            .await?
            .into_inner();

        if !response.accepted {
            return Err(BatcherError::Rejected(response.error));
        }
        Ok(Acceptance {
            tx_id: non_empty(response.tx_id),
        })
    }

    async fn subscribe_outcomes(&self) -> Result<OutcomeStream, BatcherError> {
        let stream = self
            .client
            .clone()
            .subscribe_outcomes(OutcomeSubscription {
                channel: self.channel.clone(),
            })
            .await?
            .into_inner();

        let channel = self.channel.clone();
        Ok(Box::pin(stream.map(move |item| {
            item.map(|outcome| to_outcome(&channel, outcome))
                .map_err(BatcherError::from)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_conversion_drops_empty_fields() {
        let outcome = to_outcome(
            "FIAT",
            TransferOutcome {
                transfer_id: "t1".to_string(),
                success: true,
                message: String::new(),
                tx_id: "tx-9".to_string(),
            },
        );
        assert_eq!(outcome.channel, "FIAT");
        assert!(outcome.success);
        assert_eq!(outcome.message, None);
        assert_eq!(outcome.tx_id.as_deref(), Some("tx-9"));
    }

    #[tokio::test]
    async fn test_invalid_address_is_endpoint_error() {
        let result = GrpcBatcherClient::connect_lazy("FIAT", "not a uri\n");
        assert!(matches!(result, Err(BatcherError::Endpoint(_))));
    }

    #[test]
    fn test_missing_address_is_rejected() {
        let result = GrpcBatcherClient::connect_lazy("fiat", "");
        assert!(matches!(result, Err(BatcherError::Endpoint(msg)) if msg.contains("fiat")));
    }
}
