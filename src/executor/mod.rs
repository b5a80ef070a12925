//! Per-channel executor pools.
//!
//! Every destination channel gets a [`ChannelExecutor`]: a bounded buffer of
//! pending transfer ids drained by a dispatcher that starts one worker per
//! transfer. Workers hold a semaphore permit from dequeue until their
//! transfer is terminal, so the number of transfers in flight on a channel
//! never exceeds the pool width. A transfer id already held by a worker is
//! dropped at dequeue, so enqueueing the same transfer twice runs it once.
//!
//! Workers are stateless: they re-read the record (and its preimage) from
//! the store and derive what to do from it, which is what makes re-enqueueing
//! unfinished transfers after a restart safe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::BatcherClient;
use crate::config::Config;
use crate::model::SettlementNotice;
use crate::storage::{StorageError, TransferStore};
use crate::utils::retry::RetryConfig;

mod worker;

use worker::Worker;

/// Errors from enqueueing work.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor for channel '{0}'")]
    UnknownChannel(String),

    #[error("Executor for channel '{0}' is shut down")]
    Closed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Tuning shared by all channel executors.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Concurrent in-flight transfers per channel.
    pub width: usize,
    /// Capacity of the pending buffer.
    pub buffer: usize,
    /// Submission retry policy.
    pub retry: RetryConfig,
    /// Per-attempt deadline.
    pub attempt_timeout: Option<Duration>,
    /// Time terminal records are kept.
    pub retention: Duration,
    /// Store re-read interval while awaiting settlement.
    pub settle_poll_interval: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let options = &config.options;
        Self {
            width: options.transfers_in_handle_on_channel,
            buffer: options.newest_request_stream_buffer_size,
            retry: options.retry(),
            attempt_timeout: options.attempt_timeout(),
            retention: config.redis_storage.after_transfer_ttl,
            settle_poll_interval: options.settle_poll_interval,
        }
    }
}

/// Transfer ids currently held by a worker on one channel.
#[derive(Clone, Default)]
struct ActiveTransfers(Arc<Mutex<HashSet<String>>>);

impl ActiveTransfers {
    fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `transfer_id`, or `None` if a worker already holds it.
    fn try_hold(&self, transfer_id: &str) -> Option<ActiveGuard> {
        if !self.ids().insert(transfer_id.to_string()) {
            return None;
        }
        Some(ActiveGuard {
            active: self.clone(),
            transfer_id: transfer_id.to_string(),
        })
    }

    fn len(&self) -> usize {
        self.ids().len()
    }
}

/// Releases its transfer id when the worker finishes.
struct ActiveGuard {
    active: ActiveTransfers,
    transfer_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.ids().remove(&self.transfer_id);
    }
}

/// Bounded worker pool for one destination channel.
pub struct ChannelExecutor {
    channel: String,
    sender: mpsc::Sender<String>,
    active: ActiveTransfers,
}

impl ChannelExecutor {
    /// Start the dispatcher for `batcher`'s channel.
    pub fn spawn(
        batcher: Arc<dyn BatcherClient>,
        store: Arc<dyn TransferStore>,
        notices: broadcast::Sender<SettlementNotice>,
        settings: ExecutorSettings,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let channel = batcher.channel().to_lowercase();
        let (sender, receiver) = mpsc::channel(settings.buffer);
        let permits = Arc::new(Semaphore::new(settings.width));
        let active = ActiveTransfers::default();

        let worker = Worker::new(batcher, store, notices, settings, cancel.clone());
        let handle = tokio::spawn(dispatch(
            channel.clone(),
            receiver,
            permits,
            active.clone(),
            worker,
            cancel,
        ));

        let executor = Self {
            channel,
            sender,
            active,
        };
        (executor, handle)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Queue a transfer. Waits while the pending buffer is full.
    pub async fn enqueue(&self, transfer_id: String) -> Result<(), ExecutorError> {
        self.sender
            .send(transfer_id)
            .await
            .map_err(|_| ExecutorError::Closed(self.channel.clone()))
    }

    /// Transfers currently holding a worker slot.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}

/// Take a permit, then the next transfer id, then hand both to a worker.
///
/// Acquiring the permit first leaves ids in the buffer while the pool is
/// saturated, so a full pool backs up into the buffer and from there into
/// the gateway.
async fn dispatch(
    channel: String,
    mut receiver: mpsc::Receiver<String>,
    permits: Arc<Semaphore>,
    active: ActiveTransfers,
    worker: Worker,
    cancel: CancellationToken,
) {
    info!(channel = %channel, "Executor started");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let transfer_id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let Some(held) = active.try_hold(&transfer_id) else {
            debug!(channel = %channel, transfer_id = %transfer_id, "Transfer already in a worker, dropping duplicate");
            continue;
        };

        debug!(channel = %channel, transfer_id = %transfer_id, "Dispatching transfer");
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.run(&transfer_id).await;
            drop(held);
            drop(permit);
        });
    }

    info!(channel = %channel, "Executor stopped");
}

/// Executors indexed by lowercased destination channel name.
pub struct ExecutorRegistry {
    executors: HashMap<String, ChannelExecutor>,
    store: Arc<dyn TransferStore>,
}

impl ExecutorRegistry {
    /// Start one executor per batcher.
    pub fn start(
        batchers: Vec<Arc<dyn BatcherClient>>,
        store: Arc<dyn TransferStore>,
        notices: broadcast::Sender<SettlementNotice>,
        settings: ExecutorSettings,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut executors = HashMap::new();
        let mut handles = Vec::new();

        for batcher in batchers {
            let (executor, handle) = ChannelExecutor::spawn(
                batcher,
                store.clone(),
                notices.clone(),
                settings.clone(),
                cancel.clone(),
            );
            handles.push(handle);
            executors.insert(executor.channel().to_string(), executor);
        }

        (Self { executors, store }, handles)
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelExecutor> {
        self.executors.get(&channel.to_lowercase())
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.get(channel).is_some()
    }

    /// Names of all served channels.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue `transfer_id` on `channel`'s executor.
    pub async fn enqueue(&self, channel: &str, transfer_id: String) -> Result<(), ExecutorError> {
        self.get(channel)
            .ok_or_else(|| ExecutorError::UnknownChannel(channel.to_string()))?
            .enqueue(transfer_id)
            .await
    }

    /// Re-enqueue every unfinished transfer found in the store.
    ///
    /// Run once at startup, from its own task: enqueueing blocks while
    /// buffers are full. Returns the number of transfers re-enqueued.
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let unfinished = self.store.list_unfinished().await?;
        let mut recovered = 0;

        for record in unfinished {
            match self
                .enqueue(&record.destination_channel, record.transfer_id.clone())
                .await
            {
                Ok(()) => recovered += 1,
                Err(ExecutorError::UnknownChannel(channel)) => {
                    warn!(
                        transfer_id = %record.transfer_id,
                        channel = %channel,
                        "Unfinished transfer targets an unserved channel, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(recovered, "Recovered unfinished transfers");
        Ok(recovered)
    }
}
