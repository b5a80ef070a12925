//! End-to-end transfer flow.
//!
//! Drives signed requests through the gRPC service, the per-channel
//! executors and the result collector, against the in-memory store and
//! scripted batchers.
//!
//! Run with: cargo test --test pipeline --features test-utils

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};

use channel_transfer::batcher::BatcherClient;
use channel_transfer::config::{BatcherEndpoint, ChannelConfig, Config};
use channel_transfer::proto::channel_transfer::api_server::Api;
use channel_transfer::proto::channel_transfer::transfer_status_response::Status as WireStatus;
use channel_transfer::proto::channel_transfer::{TransferStatusRequest, TransferStatusResponse};
use channel_transfer::services::TransferApiService;
use channel_transfer::storage::{KeySpace, MemoryTransferStore};
use channel_transfer::test_utils::{eventually, AutoSettle, MockBatcher, TestSigner, TransferFixture};
use channel_transfer::TransferContext;

const ADMIN_SEED: u8 = 9;
const RETENTION: Duration = Duration::from_millis(300);

struct Pipeline {
    context: TransferContext,
    api: TransferApiService,
    cc: Arc<MockBatcher>,
    fiat: Arc<MockBatcher>,
}

fn config() -> Config {
    let mut config = Config::default();
    config.channels = ["cc", "fiat"]
        .into_iter()
        .map(|name| ChannelConfig {
            name: name.to_string(),
            batcher: BatcherEndpoint::default(),
        })
        .collect();
    config.options.retry_execute_delay = Duration::from_millis(10);
    config.options.retry_execute_max_delay = Duration::from_millis(40);
    config.options.settle_poll_interval = Duration::from_millis(20);
    config.options.eviction_interval = Duration::from_millis(50);
    config.options.admin_public_keys = vec![TestSigner::new(ADMIN_SEED).public_key()];
    config.redis_storage.after_transfer_ttl = RETENTION;
    config
}

fn start() -> Pipeline {
    let cc = Arc::new(MockBatcher::new("cc").with_auto_settle(AutoSettle::Succeed));
    let fiat = Arc::new(MockBatcher::new("fiat").with_auto_settle(AutoSettle::Fail));
    let store = Arc::new(MemoryTransferStore::new(KeySpace::new(
        "transfer",
        "batchTransactions",
    )));
    let batchers = vec![
        cc.clone() as Arc<dyn BatcherClient>,
        fiat.clone() as Arc<dyn BatcherClient>,
    ];

    let context = TransferContext::start_with(config(), store, batchers, CancellationToken::new());
    let api = context.api_service();
    Pipeline {
        context,
        api,
        cc,
        fiat,
    }
}

async fn status_of(api: &TransferApiService, transfer_id: &str) -> Result<TransferStatusResponse, tonic::Status> {
    api.transfer_status(Request::new(TransferStatusRequest {
        id_transfer: transfer_id.to_string(),
    }))
    .await
    .map(|r| r.into_inner())
}

async fn wait_for(api: &TransferApiService, transfer_id: &str, expected: WireStatus) -> TransferStatusResponse {
    let mut last = None;
    for _ in 0..200 {
        if let Ok(response) = status_of(api, transfer_id).await {
            if response.status == expected as i32 {
                return response;
            }
            last = Some(response);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transfer {} never reached {:?}, last: {:?}", transfer_id, expected, last);
}

#[tokio::test]
async fn test_customer_transfer_completes() {
    let pipeline = start();
    let signer = TestSigner::new(1);
    let fixture = TransferFixture::new("t-customer");

    let admitted = pipeline
        .api
        .transfer_by_customer(Request::new(signer.customer_request(&fixture)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(admitted.id_transfer, "t-customer");
    assert_eq!(admitted.status, WireStatus::InProcess as i32);

    let done = wait_for(&pipeline.api, "t-customer", WireStatus::Completed).await;
    assert_eq!(done.message, "");

    let submissions = pipeline.cc.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].transfer_id, "t-customer");
    assert_eq!(submissions[0].args[2], signer.address());
    assert_eq!(pipeline.fiat.submit_count(), 0);

    pipeline.context.shutdown().await;
}

#[tokio::test]
async fn test_admin_transfer_fails_with_diagnostic() {
    let pipeline = start();
    let admin = TestSigner::new(ADMIN_SEED);
    let owner = TestSigner::new(2);

    let mut fixture = TransferFixture::new("t-admin");
    fixture.source = "cc".to_string();
    fixture.chaincode = "cc".to_string();
    fixture.destination = "fiat".to_string();
    fixture.address = owner.address();

    pipeline
        .api
        .transfer_by_admin(Request::new(admin.admin_request(&fixture)))
        .await
        .unwrap();

    let failed = wait_for(&pipeline.api, "t-admin", WireStatus::Error).await;
    assert_eq!(failed.message, "insufficient funds");
    assert_eq!(pipeline.fiat.submit_count(), 1);

    pipeline.context.shutdown().await;
}

#[tokio::test]
async fn test_non_admin_key_is_denied() {
    let pipeline = start();
    let impostor = TestSigner::new(3);
    let mut fixture = TransferFixture::new("t-impostor");
    fixture.address = TestSigner::new(4).address();

    let err = pipeline
        .api
        .transfer_by_admin(Request::new(impostor.admin_request(&fixture)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = status_of(&pipeline.api, "t-impostor").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    pipeline.context.shutdown().await;
}

#[tokio::test]
async fn test_retried_request_is_not_executed_twice() {
    let pipeline = start();
    let signer = TestSigner::new(5);
    let fixture = TransferFixture::new("t-retry");
    let request = signer.customer_request(&fixture);

    pipeline
        .api
        .transfer_by_customer(Request::new(request.clone()))
        .await
        .unwrap();
    wait_for(&pipeline.api, "t-retry", WireStatus::Completed).await;

    let again = pipeline
        .api
        .transfer_by_customer(Request::new(request))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(again.id_transfer, "t-retry");
    assert_eq!(again.status, WireStatus::Completed as i32);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.cc.submit_count(), 1);

    pipeline.context.shutdown().await;
}

#[tokio::test]
async fn test_unknown_destination_is_rejected() {
    let pipeline = start();
    let signer = TestSigner::new(6);
    let mut fixture = TransferFixture::new("t-nowhere");
    fixture.destination = "nowhere".to_string();

    let err = pipeline
        .api
        .transfer_by_customer(Request::new(signer.customer_request(&fixture)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    pipeline.context.shutdown().await;
}

#[tokio::test]
async fn test_terminal_transfer_expires() {
    let pipeline = start();
    let signer = TestSigner::new(7);
    let fixture = TransferFixture::new("t-expire");

    pipeline
        .api
        .transfer_by_customer(Request::new(signer.customer_request(&fixture)))
        .await
        .unwrap();
    wait_for(&pipeline.api, "t-expire", WireStatus::Completed).await;

    let api = &pipeline.api;
    eventually(100, || async move {
        matches!(status_of(api, "t-expire").await, Err(e) if e.code() == Code::NotFound)
    })
    .await;

    pipeline.context.shutdown().await;
}
