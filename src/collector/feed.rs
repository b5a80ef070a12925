//! Outcome feed: pipes one batcher's settlement stream into the collector.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{BatcherClient, BatcherError, OutcomeStream};
use crate::model::SettlementOutcome;
use crate::utils::retry::outcome_feed_backoff;

/// Pause between a dropped stream and the next subscription.
const RESUBSCRIBE_PAUSE: Duration = Duration::from_millis(100);

/// Subscribe to `batcher`'s outcomes and forward them into `sink`.
///
/// Re-subscribes with backoff whenever the subscription fails or the stream
/// ends. Forwarding waits while the collector buffer is full.
pub fn spawn_outcome_feed(
    batcher: Arc<dyn BatcherClient>,
    sink: mpsc::Sender<SettlementOutcome>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = batcher.channel().to_string();
        info!(channel = %channel, "Outcome feed started");

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = subscribe(batcher.as_ref()) => stream,
            };
            let Ok(stream) = stream else {
                break;
            };

            if !forward(&channel, stream, &sink, &cancel).await {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_PAUSE) => {}
            }
        }

        info!(channel = %channel, "Outcome feed stopped");
    })
}

async fn subscribe(batcher: &dyn BatcherClient) -> Result<OutcomeStream, BatcherError> {
    (|| async { batcher.subscribe_outcomes().await })
        .retry(outcome_feed_backoff())
        .notify(|err: &BatcherError, dur: Duration| {
            warn!(
                channel = %batcher.channel(),
                error = %err,
                delay = ?dur,
                "Outcome subscription failed, retrying"
            );
        })
        .await
}

/// Drain `stream` into `sink`. Returns false when the feed should stop.
async fn forward(
    channel: &str,
    mut stream: OutcomeStream,
    sink: &mpsc::Sender<SettlementOutcome>,
    cancel: &CancellationToken,
) -> bool {
    debug!(channel = %channel, "Outcome stream connected");

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return false,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(outcome)) => {
                debug!(
                    channel = %channel,
                    transfer_id = %outcome.transfer_id,
                    success = outcome.success,
                    "Received settlement outcome"
                );
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return false,
                    sent = sink.send(outcome) => sent,
                };
                if sent.is_err() {
                    // Collector is gone.
                    return false;
                }
            }
            Some(Err(e)) => {
                warn!(channel = %channel, error = %e, "Outcome stream failed, resubscribing");
                return true;
            }
            None => {
                warn!(channel = %channel, "Outcome stream ended, resubscribing");
                return true;
            }
        }
    }
}
