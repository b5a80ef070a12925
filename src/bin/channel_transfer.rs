//! channel-transfer: cross-channel transfer orchestrator
//!
//! ## Architecture
//! ```text
//! clients --(core.channel_transfer.API gRPC)--> channel-transfer
//!                                                   |
//!                         +-------------------------+------------------+
//!                         |                         |                  |
//!                      Redis           batcher (channel A)   batcher (channel B)
//! ```
//!
//! ## Configuration
//! ```yaml
//! log_level: info
//! log_type: json
//! listen_api:
//!   access_token: secret
//!   address_grpc: 0.0.0.0:5080
//! options:
//!   retry_execute_attempts: 3
//!   retry_execute_delay: 500ms
//!   retry_execute_max_delay: 2s
//!   admin_public_keys: [ "..." ]
//! channels:
//!   - name: cc
//!     batcher:
//!       address_grpc: localhost:8881
//! redis_storage:
//!   addr: [ "localhost:6379" ]
//!   after_transfer_ttl: 3600s
//! ```
//!
//! The config file comes from `--config <path>`, `CHANNEL_TRANSFER_CONFIG`
//! or `./config.yaml`; `CHANNEL_TRANSFER__*` variables override single keys.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use channel_transfer::config::Config;
use channel_transfer::transport;
use channel_transfer::utils::bootstrap::{init_tracing, parse_config_path};
use channel_transfer::TransferContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.log_level, config.log_type);

    info!(
        channels = ?config.channel_names(),
        listen = %config.listen_api.address_grpc,
        "channel-transfer starting"
    );

    let cancel = CancellationToken::new();
    let listen = config.listen_api.clone();
    let context = TransferContext::start(config, cancel.clone()).await?;

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let served = transport::serve(&listen, context.api_service(), cancel.clone()).await;
    if let Err(e) = &served {
        error!(error = %e, "Transfer API failed");
    }

    context.shutdown().await;
    served
}
