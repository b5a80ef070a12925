//! Test utilities and mock implementations.
//!
//! A scripted batcher, record fixtures and a request signer for testing the
//! pipeline without a batcher service or Redis.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::batcher::{Acceptance, BatcherClient, BatcherError, OutcomeStream, Submission};
use crate::gateway::signature::{address_from_key_bytes, signed_message};
use crate::gateway::TransferRequest;
use crate::model::{Originator, SettlementOutcome, TransferRecord, TransferStatus};
use crate::proto::channel_transfer::{
    GeneralParams, TransferBeginAdminRequest, TransferBeginCustomerRequest,
};

/// A `Created` record moving `asset` from `source` to `destination`.
pub fn sample_record(transfer_id: &str, source: &str, destination: &str) -> TransferRecord {
    TransferRecord {
        transfer_id: transfer_id.to_string(),
        request_id: format!("req-{}", transfer_id),
        originator: Originator::Customer,
        source_channel: source.to_string(),
        destination_channel: destination.to_string(),
        chaincode: source.to_lowercase(),
        address: "2datxk5TmB1spSNn9enVo11dcpgmUoSBSqCw5yrGHQh2".to_string(),
        asset: "FIAT".to_string(),
        amount: "250".to_string(),
        status: TransferStatus::Created,
        attempt_count: 0,
        created_at: Utc::now(),
        terminal_at: None,
        expires_at: None,
        message: None,
        batcher_tx_id: None,
        awaiting_reply: false,
    }
}

/// What the mock does with a settled submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSettle {
    /// Leave settlement to the test.
    Off,
    /// Emit a successful outcome after every acceptance.
    Succeed,
    /// Emit a failed outcome after every acceptance.
    Fail,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Result<Acceptance, BatcherError>>,
    submissions: Vec<Submission>,
    subscribers: Vec<mpsc::Sender<Result<SettlementOutcome, BatcherError>>>,
    backlog: Vec<SettlementOutcome>,
    subscribe_failures: usize,
}

/// Scripted batcher.
///
/// Answers submissions from a script, accepting once the script runs out,
/// and delivers outcomes pushed with [`MockBatcher::settle`] to every
/// outcome subscriber. Outcomes emitted before anyone subscribed are held
/// back and delivered to the first subscriber.
pub struct MockBatcher {
    channel: String,
    auto_settle: Mutex<AutoSettle>,
    state: Mutex<MockState>,
    subscriptions: AtomicUsize,
}

impl MockBatcher {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            auto_settle: Mutex::new(AutoSettle::Off),
            state: Mutex::new(MockState::default()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_auto_settle(self, mode: AutoSettle) -> Self {
        *self.auto_settle.lock().unwrap_or_else(|e| e.into_inner()) = mode;
        self
    }

    /// Queue answers for the next submissions, in order.
    pub fn script(&self, answers: impl IntoIterator<Item = Result<Acceptance, BatcherError>>) {
        self.state().script.extend(answers);
    }

    /// Make the next `n` outcome subscriptions fail.
    pub fn fail_subscriptions(&self, n: usize) {
        self.state().subscribe_failures = n;
    }

    /// Submissions received so far.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Successful outcome subscriptions so far.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Report a settlement outcome.
    pub fn settle(&self, transfer_id: &str, success: bool, message: Option<&str>) {
        let outcome = SettlementOutcome {
            transfer_id: transfer_id.to_string(),
            channel: self.channel.clone(),
            success,
            message: message.map(str::to_string),
            tx_id: None,
        };
        self.emit(outcome);
    }

    /// Terminate every open outcome stream with `error`.
    pub fn break_streams(&self, error: BatcherError) {
        let subscribers = std::mem::take(&mut self.state().subscribers);
        for subscriber in subscribers {
            let _ = subscriber.try_send(Err(error.clone()));
        }
    }

    fn emit(&self, outcome: SettlementOutcome) {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.is_closed());
        if state.subscribers.is_empty() {
            state.backlog.push(outcome);
            return;
        }
        for subscriber in &state.subscribers {
            let _ = subscriber.try_send(Ok(outcome.clone()));
        }
    }
}

#[async_trait]
impl BatcherClient for MockBatcher {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn submit(&self, submission: &Submission) -> Result<Acceptance, BatcherError> {
        let answer = {
            let mut state = self.state();
            state.submissions.push(submission.clone());
            state.script.pop_front().unwrap_or(Ok(Acceptance {
                tx_id: Some(format!("tx-{}", submission.transfer_id)),
            }))
        };

        if answer.is_ok() {
            let mode = *self.auto_settle.lock().unwrap_or_else(|e| e.into_inner());
            match mode {
                AutoSettle::Off => {}
                AutoSettle::Succeed => self.settle(&submission.transfer_id, true, None),
                AutoSettle::Fail => {
                    self.settle(&submission.transfer_id, false, Some("insufficient funds"))
                }
            }
        }
        answer
    }

    async fn subscribe_outcomes(&self) -> Result<OutcomeStream, BatcherError> {
        let mut state = self.state();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(BatcherError::Transient("subscription refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(1024);
        for outcome in state.backlog.drain(..) {
            let _ = tx.try_send(Ok(outcome));
        }
        state.subscribers.push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Business fields of a transfer request.
#[derive(Debug, Clone)]
pub struct TransferFixture {
    pub request_id: String,
    pub transfer_id: String,
    pub chaincode: String,
    pub source: String,
    pub destination: String,
    pub address: String,
    pub token: String,
    pub amount: String,
    pub nonce: String,
}

impl TransferFixture {
    /// 250 FIAT from `fiat` to `cc`, nonce = now.
    pub fn new(transfer_id: &str) -> Self {
        Self {
            request_id: format!("req-{}", transfer_id),
            transfer_id: transfer_id.to_string(),
            chaincode: "fiat".to_string(),
            source: "fiat".to_string(),
            destination: "cc".to_string(),
            address: String::new(),
            token: "FIAT".to_string(),
            amount: "250".to_string(),
            nonce: Utc::now().timestamp_millis().to_string(),
        }
    }
}

/// Ed25519 key signing requests the way clients do.
pub struct TestSigner {
    key: SigningKey,
}

impl TestSigner {
    /// Deterministic key derived from `seed`.
    pub fn new(seed: u8) -> Self {
        Self {
            key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    /// Base58 public key.
    pub fn public_key(&self) -> String {
        bs58::encode(self.key.verifying_key().as_bytes()).into_string()
    }

    /// Address owned by this key.
    pub fn address(&self) -> String {
        address_from_key_bytes(self.key.verifying_key().as_bytes())
    }

    fn signed(&self, originator: Originator, fixture: &TransferFixture) -> GeneralParams {
        let mut request = TransferRequest {
            originator,
            method_name: originator.method_name().to_string(),
            request_id: fixture.request_id.clone(),
            chaincode: fixture.chaincode.clone(),
            source_channel: fixture.source.clone(),
            nonce: fixture.nonce.clone(),
            public_key: self.public_key(),
            signature: String::new(),
            transfer_id: fixture.transfer_id.clone(),
            destination_channel: fixture.destination.clone(),
            address: fixture.address.clone(),
            asset: fixture.token.clone(),
            amount: fixture.amount.clone(),
        };
        let signature = self.key.sign(&signed_message(&request));
        request.signature = bs58::encode(signature.to_bytes()).into_string();

        GeneralParams {
            method_name: request.method_name,
            request_id: request.request_id,
            chaincode: request.chaincode,
            channel: request.source_channel,
            nonce: request.nonce,
            public_key: request.public_key,
            sign: request.signature,
        }
    }

    pub fn customer_request(&self, fixture: &TransferFixture) -> TransferBeginCustomerRequest {
        TransferBeginCustomerRequest {
            generals: Some(self.signed(Originator::Customer, fixture)),
            id_transfer: fixture.transfer_id.clone(),
            channel_to: fixture.destination.clone(),
            token: fixture.token.clone(),
            amount: fixture.amount.clone(),
            address: fixture.address.clone(),
        }
    }

    pub fn admin_request(&self, fixture: &TransferFixture) -> TransferBeginAdminRequest {
        TransferBeginAdminRequest {
            generals: Some(self.signed(Originator::Admin, fixture)),
            id_transfer: fixture.transfer_id.clone(),
            channel_to: fixture.destination.clone(),
            address: fixture.address.clone(),
            token: fixture.token.clone(),
            amount: fixture.amount.clone(),
        }
    }
}

/// Poll `check` until it holds, yielding to other tasks in between.
///
/// Panics after `attempts` polls.
pub async fn eventually<F, Fut>(attempts: usize, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached after {} polls", attempts);
}
