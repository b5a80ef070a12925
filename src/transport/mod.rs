//! gRPC server plumbing: access-token check, request tracing and serving.

use std::net::SocketAddr;

use tonic::codegen::http;
use tonic::service::Interceptor;
use tonic::transport::Server;
use tonic::{Request, Status};
use tonic_health::server::health_reporter;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ListenApiConfig;
use crate::proto::channel_transfer::api_server::ApiServer;
use crate::services::TransferApiService;

/// Metadata key carrying the access token.
pub const AUTHORIZATION: &str = "authorization";

/// Rejects calls that do not present the configured access token.
///
/// Accepts the bare token or `Bearer <token>`. An empty configured token
/// disables the check.
#[derive(Clone)]
pub struct AccessTokenInterceptor {
    token: Option<String>,
}

impl AccessTokenInterceptor {
    pub fn new(token: &str) -> Self {
        Self {
            token: (!token.is_empty()).then(|| token.to_string()),
        }
    }
}

impl Interceptor for AccessTokenInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let Some(expected) = &self.token else {
            return Ok(request);
        };

        let presented = request
            .metadata()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

        match presented {
            Some(token) if token == expected.as_str() => {}
            Some(_) => return Err(Status::unauthenticated("invalid access token")),
            None => return Err(Status::unauthenticated("missing access token")),
        }
        Ok(request)
    }
}

/// Create a TraceLayer that opens one span per gRPC call.
///
/// The span carries the request path and the caller's `x-request-id`, so
/// every log line emitted while handling the call can be correlated.
pub fn grpc_trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::GrpcErrorsAsFailures>,
    impl Fn(&http::Request<tonic::body::BoxBody>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_grpc().make_span_with(|request: &http::Request<tonic::body::BoxBody>| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path = request.uri().path();
        tracing::info_span!("grpc", %request_id, %path)
    })
}

/// Serve the transfer API and the health service until `cancel` fires.
pub async fn serve(
    config: &ListenApiConfig,
    api: TransferApiService,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.address_grpc.parse()?;
    let interceptor = AccessTokenInterceptor::new(&config.access_token);

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<ApiServer<TransferApiService>>()
        .await;

    info!(
        address = %addr,
        access_token = !config.access_token.is_empty(),
        "Transfer API listening"
    );

    Server::builder()
        .layer(grpc_trace_layer())
        .add_service(health_service)
        .add_service(ApiServer::with_interceptor(api, interceptor))
        .serve_with_shutdown(addr, cancel.cancelled_owned())
        .await?;

    info!("Transfer API stopped");
    Ok(())
}
