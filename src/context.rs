//! Process-wide transfer context.
//!
//! Builds every pipeline component once, wires them together and owns the
//! background tasks:
//!
//! ```text
//! IntakeGateway --> ExecutorRegistry --(submit)--> BatcherClient
//!                                                       |
//!   StatusHandler <-- TransferStore <-- ResultCollector <-- outcome feeds
//! ```
//!
//! All tasks share one `CancellationToken`; cancelling it stops the
//! dispatchers, workers, feeds, collector and eviction sweep.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::batcher::{BatcherClient, BatcherError, GrpcBatcherClient};
use crate::collector::{spawn_outcome_feed, ResultCollector};
use crate::config::Config;
use crate::executor::{ExecutorRegistry, ExecutorSettings};
use crate::gateway::{Ed25519Verifier, IntakeGateway};
use crate::services::{StatusHandler, TransferApiService};
use crate::storage::{init_storage, spawn_eviction_sweep, StorageError, TransferStore};

/// Minimum capacity of the settlement notice broadcast.
const MIN_NOTICE_BUFFER: usize = 1024;

/// Errors while building the context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Channel '{channel}': {source}")]
    Batcher {
        channel: String,
        #[source]
        source: BatcherError,
    },
}

/// Shared pipeline components and their background tasks.
pub struct TransferContext {
    pub config: Config,
    pub store: Arc<dyn TransferStore>,
    pub executors: Arc<ExecutorRegistry>,
    pub collector: Arc<ResultCollector>,
    pub gateway: Arc<IntakeGateway>,
    pub status: Arc<StatusHandler>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TransferContext {
    /// Connect storage and batchers from `config` and start the pipeline.
    pub async fn start(config: Config, cancel: CancellationToken) -> Result<Self, ContextError> {
        let store = init_storage(&config).await?;

        let mut batchers: Vec<Arc<dyn BatcherClient>> = Vec::new();
        for channel in &config.channels {
            let client = GrpcBatcherClient::connect_lazy(&channel.name, &channel.batcher.address_grpc)
                .map_err(|source| ContextError::Batcher {
                    channel: channel.name.clone(),
                    source,
                })?;
            batchers.push(Arc::new(client));
        }

        Ok(Self::start_with(config, store, batchers, cancel))
    }

    /// Start the pipeline over already constructed store and batchers.
    pub fn start_with(
        config: Config,
        store: Arc<dyn TransferStore>,
        batchers: Vec<Arc<dyn BatcherClient>>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = ExecutorSettings::from_config(&config);
        let options = &config.options;
        let (notices, _) = broadcast::channel(
            MIN_NOTICE_BUFFER.max(settings.width.saturating_mul(batchers.len())),
        );
        let mut tasks = Vec::new();

        let collector = Arc::new(ResultCollector::new(
            store.clone(),
            notices.clone(),
            settings.retention,
        ));
        let (sink, handle) = collector
            .clone()
            .spawn(options.collectors_buf_size, cancel.clone());
        tasks.push(handle);

        for batcher in &batchers {
            tasks.push(spawn_outcome_feed(
                batcher.clone(),
                sink.clone(),
                cancel.clone(),
            ));
        }

        let (executors, handles) = ExecutorRegistry::start(
            batchers,
            store.clone(),
            notices,
            settings,
            cancel.clone(),
        );
        let executors = Arc::new(executors);
        tasks.extend(handles);

        tasks.push(spawn_eviction_sweep(
            store.clone(),
            options.eviction_interval,
            cancel.clone(),
        ));

        let recovery = executors.clone();
        let recovery_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = recovery_cancel.cancelled() => {}
                result = recovery.recover() => {
                    if let Err(e) = result {
                        error!(error = %e, "Recovery of unfinished transfers failed");
                    }
                }
            }
        }));

        let gateway = Arc::new(IntakeGateway::new(
            store.clone(),
            executors.clone(),
            Arc::new(Ed25519Verifier),
            options.admin_public_keys.iter().cloned(),
            options.ttl,
        ));
        let status = Arc::new(StatusHandler::new(store.clone()));

        info!(channels = ?executors.channels(), "Transfer pipeline started");

        Self {
            config,
            store,
            executors,
            collector,
            gateway,
            status,
            cancel,
            tasks,
        }
    }

    /// gRPC service backed by this context.
    pub fn api_service(&self) -> TransferApiService {
        TransferApiService::new(self.gateway.clone(), self.status.clone())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all background tasks and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = futures::future::join_all(self.tasks).await;
        info!("Transfer pipeline stopped");
    }
}
