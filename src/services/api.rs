//! `core.channel_transfer.API` service.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::gateway::{IntakeGateway, TransferRequest};
use crate::proto::channel_transfer::api_server::Api;
use crate::proto::channel_transfer::{
    TransferBeginAdminRequest, TransferBeginCustomerRequest, TransferStatusRequest,
    TransferStatusResponse,
};
use crate::services::status::{to_response, StatusHandler};

/// gRPC front of the intake gateway and status handler.
pub struct TransferApiService {
    gateway: Arc<IntakeGateway>,
    status: Arc<StatusHandler>,
}

impl TransferApiService {
    pub fn new(gateway: Arc<IntakeGateway>, status: Arc<StatusHandler>) -> Self {
        Self { gateway, status }
    }

    async fn begin(&self, request: TransferRequest) -> Result<Response<TransferStatusResponse>, Status> {
        let transfer_id = request.transfer_id.clone();
        let originator = request.originator;

        match self.gateway.submit(request).await {
            Ok(record) => Ok(Response::new(to_response(&record))),
            Err(e) => {
                warn!(
                    transfer_id = %transfer_id,
                    originator = ?originator,
                    error = %e,
                    "Transfer rejected"
                );
                Err(e.into())
            }
        }
    }
}

#[tonic::async_trait]
impl Api for TransferApiService {
    async fn transfer_by_customer(
        &self,
        request: Request<TransferBeginCustomerRequest>,
    ) -> Result<Response<TransferStatusResponse>, Status> {
        let request = TransferRequest::from_customer(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        info!(transfer_id = %request.transfer_id, "TransferByCustomer");
        self.begin(request).await
    }

    async fn transfer_by_admin(
        &self,
        request: Request<TransferBeginAdminRequest>,
    ) -> Result<Response<TransferStatusResponse>, Status> {
        let request = TransferRequest::from_admin(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        info!(transfer_id = %request.transfer_id, "TransferByAdmin");
        self.begin(request).await
    }

    async fn transfer_status(
        &self,
        request: Request<TransferStatusRequest>,
    ) -> Result<Response<TransferStatusResponse>, Status> {
        let request = request.into_inner();
        self.status
            .status(&request.id_transfer)
            .await
            .map(Response::new)
    }
}
